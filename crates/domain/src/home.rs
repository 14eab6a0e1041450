//! Persisted-state layout.
//!
//! All on-disk state lives under one base directory:
//!
//! ```text
//! $WEFT_HOME/
//!   weft.db                   event-store database
//!   provider-instances.json   provider instance configuration
//!   credentials/              one credential file per instance (0600)
//!   user-catalog/             per-provider model catalog overrides
//! ```
//!
//! `WEFT_HOME` overrides the default of `~/.weft`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable pointing at the base state directory.
pub const HOME_ENV: &str = "WEFT_HOME";

/// Resolved base directory for all persisted state.
#[derive(Debug, Clone)]
pub struct WeftHome {
    base: PathBuf,
}

impl WeftHome {
    /// Resolve from `WEFT_HOME`, falling back to `~/.weft`.
    pub fn resolve() -> Result<Self> {
        if let Ok(dir) = std::env::var(HOME_ENV) {
            if !dir.is_empty() {
                return Ok(Self { base: dir.into() });
            }
        }
        let home = dirs::home_dir().ok_or_else(|| {
            Error::config(
                "cannot locate a home directory",
                format!("set {HOME_ENV} to a writable directory"),
            )
        })?;
        Ok(Self {
            base: home.join(".weft"),
        })
    }

    /// Use an explicit base directory (tests, embedding).
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create the directory tree if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.credentials_dir())?;
        std::fs::create_dir_all(self.user_catalog_dir())?;
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn database_path(&self) -> PathBuf {
        self.base.join("weft.db")
    }

    pub fn instances_path(&self) -> PathBuf {
        self.base.join("provider-instances.json")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.base.join("credentials")
    }

    pub fn credential_path(&self, instance_id: &str) -> PathBuf {
        self.credentials_dir().join(format!("{instance_id}.json"))
    }

    pub fn user_catalog_dir(&self) -> PathBuf {
        self.base.join("user-catalog")
    }

    pub fn catalog_path(&self, catalog_provider_id: &str) -> PathBuf {
        self.user_catalog_dir()
            .join(format!("{catalog_provider_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_base_layout() {
        let home = WeftHome::at("/tmp/weft-test");
        assert_eq!(home.database_path(), PathBuf::from("/tmp/weft-test/weft.db"));
        assert_eq!(
            home.credential_path("anthropic-main"),
            PathBuf::from("/tmp/weft-test/credentials/anthropic-main.json")
        );
        assert_eq!(
            home.catalog_path("ollama"),
            PathBuf::from("/tmp/weft-test/user-catalog/ollama.json")
        );
    }

    #[test]
    fn ensure_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let home = WeftHome::at(dir.path().join("state"));
        home.ensure().unwrap();
        assert!(home.credentials_dir().is_dir());
        assert!(home.user_catalog_dir().is_dir());
    }
}
