//! Provider instance configuration and credentials.
//!
//! Instances live in a single `provider-instances.json` document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "instances": {
//!     "anthropic-main": {
//!       "displayName": "Anthropic (main)",
//!       "catalogProviderId": "anthropic",
//!       "timeoutSecs": 120
//!     }
//!   }
//! }
//! ```
//!
//! Credentials are stored one per file under `credentials/`, keyed by
//! instance id, with permissions restricted to the owner (`0600`).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use weft_domain::home::WeftHome;
use weft_domain::{Error, Result};

pub const INSTANCES_FILE_VERSION: u32 = 1;

/// A named configuration of a provider family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstance {
    pub display_name: String,
    /// Which catalog (and adapter family) this instance uses.
    pub catalog_provider_id: String,
    /// Endpoint override. `None` means the family's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

/// The top-level instances document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesFile {
    pub version: u32,
    #[serde(default)]
    pub instances: HashMap<String, ProviderInstance>,
}

impl Default for InstancesFile {
    fn default() -> Self {
        Self {
            version: INSTANCES_FILE_VERSION,
            instances: HashMap::new(),
        }
    }
}

impl InstancesFile {
    /// Load and validate the document at `path`. A missing file is an
    /// empty configuration, not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let file: InstancesFile = serde_json::from_str(&raw).map_err(|e| {
            Error::config(
                format!("unreadable provider instances file: {e}"),
                format!("fix or remove {}", path.display()),
            )
        })?;
        if file.version > INSTANCES_FILE_VERSION {
            return Err(Error::config(
                format!("provider instances file version {} is newer than supported", file.version),
                "upgrade weft or recreate the file",
            ));
        }
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn get(&self, instance_id: &str) -> Option<&ProviderInstance> {
        self.instances.get(instance_id)
    }
}

/// A stored API credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub api_key: String,
}

/// Reads and writes per-instance credential files with restricted
/// permissions.
pub struct CredentialStore {
    home: WeftHome,
}

impl CredentialStore {
    pub fn new(home: WeftHome) -> Self {
        Self { home }
    }

    pub fn load(&self, instance_id: &str) -> Result<Credential> {
        let path = self.home.credential_path(instance_id);
        if !path.exists() {
            return Err(Error::config(
                format!("no credential stored for provider instance '{instance_id}'"),
                format!("write an apiKey to {}", path.display()),
            ));
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::config(
                format!("unreadable credential for '{instance_id}': {e}"),
                format!("fix or remove {}", path.display()),
            )
        })
    }

    pub fn store(&self, instance_id: &str, credential: &Credential) -> Result<()> {
        std::fs::create_dir_all(self.home.credentials_dir())?;
        let path = self.home.credential_path(instance_id);
        let json = serde_json::to_string_pretty(credential)?;
        std::fs::write(&path, json)?;
        restrict_permissions(&path)?;
        Ok(())
    }

    pub fn delete(&self, instance_id: &str) -> Result<()> {
        let path = self.home.credential_path(instance_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Owner read/write only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> (tempfile::TempDir, WeftHome) {
        let dir = tempfile::tempdir().unwrap();
        let home = WeftHome::at(dir.path());
        home.ensure().unwrap();
        (dir, home)
    }

    #[test]
    fn missing_instances_file_is_empty() {
        let (_dir, home) = home();
        let file = InstancesFile::load(&home.instances_path()).unwrap();
        assert!(file.instances.is_empty());
        assert_eq!(file.version, INSTANCES_FILE_VERSION);
    }

    #[test]
    fn instances_round_trip() {
        let (_dir, home) = home();
        let mut file = InstancesFile::default();
        file.instances.insert(
            "anthropic-main".into(),
            ProviderInstance {
                display_name: "Anthropic (main)".into(),
                catalog_provider_id: "anthropic".into(),
                endpoint: None,
                timeout_secs: 90,
            },
        );
        file.save(&home.instances_path()).unwrap();

        let loaded = InstancesFile::load(&home.instances_path()).unwrap();
        let instance = loaded.get("anthropic-main").unwrap();
        assert_eq!(instance.catalog_provider_id, "anthropic");
        assert_eq!(instance.timeout_secs, 90);
    }

    #[test]
    fn newer_version_is_rejected_with_remediation() {
        let (_dir, home) = home();
        std::fs::write(
            home.instances_path(),
            r#"{"version": 99, "instances": {}}"#,
        )
        .unwrap();
        let err = InstancesFile::load(&home.instances_path()).unwrap_err();
        assert!(err.diagnostic().contains("upgrade"));
    }

    #[test]
    fn timeout_defaults_when_omitted() {
        let raw = r#"{"displayName": "x", "catalogProviderId": "openai"}"#;
        let instance: ProviderInstance = serde_json::from_str(raw).unwrap();
        assert_eq!(instance.timeout_secs, 120);
    }

    #[test]
    fn credential_round_trip() {
        let (_dir, home) = home();
        let store = CredentialStore::new(home);
        store
            .store(
                "anthropic-main",
                &Credential {
                    api_key: "sk-test-123".into(),
                },
            )
            .unwrap();
        let loaded = store.load("anthropic-main").unwrap();
        assert_eq!(loaded.api_key, "sk-test-123");
    }

    #[cfg(unix)]
    #[test]
    fn credential_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, home) = home();
        let path = home.credential_path("a");
        let store = CredentialStore::new(home);
        store
            .store("a", &Credential { api_key: "k".into() })
            .unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_credential_names_the_instance() {
        let (_dir, home) = home();
        let store = CredentialStore::new(home);
        let err = store.load("ghost").unwrap_err();
        assert!(err.display_message().contains("ghost"));
        assert!(err.diagnostic().contains("apiKey"));
    }
}
