//! Provider registry.
//!
//! Resolves a named provider instance (endpoint + credential + catalog
//! entry) to a live [`Provider`] handle, validating the requested model
//! against the instance's catalog. Also hosts the diagnostics probe used
//! to produce actionable error messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use weft_domain::home::WeftHome;
use weft_domain::{Error, Result};

use crate::anthropic::AnthropicProvider;
use crate::catalog::CatalogSet;
use crate::instances::{CredentialStore, InstancesFile, ProviderInstance};
use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;
use crate::retry::RetryPolicy;
use crate::traits::{AdapterSettings, ModelLimits, Provider};

/// Mask substrings that look like API keys or bearer tokens in an error
/// message, so raw secrets never reach logs or user-visible diagnostics.
pub fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..]);
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

/// A resolved instance: the record plus its credential.
#[derive(Debug, Clone)]
pub struct ResolvedInstance {
    pub id: String,
    pub instance: ProviderInstance,
    pub api_key: String,
}

/// Connectivity + remote model availability for one instance.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub reachable: bool,
    /// Models the remote endpoint reports as available. Empty when the
    /// backend has no listing API or the probe failed.
    pub available_models: Vec<String>,
    /// Human-readable findings, including remediation hints.
    pub notes: Vec<String>,
}

/// Maps instance ids to configured [`Provider`] handles.
pub struct ProviderRegistry {
    home: WeftHome,
    instances: InstancesFile,
    credentials: CredentialStore,
    catalogs: CatalogSet,
}

impl ProviderRegistry {
    /// Load instances and catalogs from the home directory.
    pub fn load(home: WeftHome) -> Result<Self> {
        let instances = InstancesFile::load(&home.instances_path())?;
        let catalogs = CatalogSet::load(&home)?;
        let credentials = CredentialStore::new(home.clone());
        Ok(Self {
            home,
            instances,
            credentials,
            catalogs,
        })
    }

    pub fn home(&self) -> &WeftHome {
        &self.home
    }

    pub fn list_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve an instance record and its credential.
    pub fn resolve_instance(&self, instance_id: &str) -> Result<ResolvedInstance> {
        let instance = self.instances.get(instance_id).ok_or_else(|| {
            Error::config(
                format!("provider instance '{instance_id}' not found"),
                format!(
                    "add it to {} (known instances: {})",
                    self.home.instances_path().display(),
                    self.list_instances().join(", ")
                ),
            )
        })?;
        let credential = self.credentials.load(instance_id)?;
        Ok(ResolvedInstance {
            id: instance_id.to_owned(),
            instance: instance.clone(),
            api_key: credential.api_key,
        })
    }

    /// Build a live provider for `instance_id`, validating `model`
    /// against the instance's catalog. `None` selects the catalog's
    /// default model.
    pub fn create_provider(
        &self,
        instance_id: &str,
        model: Option<&str>,
    ) -> Result<(Arc<dyn Provider>, String)> {
        let resolved = self.resolve_instance(instance_id)?;
        let catalog_id = &resolved.instance.catalog_provider_id;

        let catalog = self.catalogs.get(catalog_id).ok_or_else(|| {
            Error::config(
                format!("catalog '{catalog_id}' for instance '{instance_id}' is missing"),
                format!(
                    "add {} or fix the instance's catalogProviderId",
                    self.home.catalog_path(catalog_id).display()
                ),
            )
        })?;

        let model_entry = match model {
            Some(requested) => catalog.model(requested).ok_or_else(|| {
                Error::config(
                    format!("model '{requested}' is not in catalog '{catalog_id}'"),
                    format!(
                        "pick one of: {}",
                        catalog
                            .models
                            .iter()
                            .map(|m| m.id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                )
            })?,
            None => catalog.default_model().ok_or_else(|| {
                Error::config(
                    format!("catalog '{catalog_id}' has no models"),
                    format!("add one to {}", self.home.catalog_path(catalog_id).display()),
                )
            })?,
        };
        let model_id = model_entry.id.clone();

        let settings = AdapterSettings {
            instance_id: resolved.id.clone(),
            base_url: resolved.instance.endpoint.clone().unwrap_or_default(),
            api_key: resolved.api_key,
            model: model_id.clone(),
            limits: catalog.limits(),
            default_limits: ModelLimits {
                context_window: model_entry.context_window,
                max_completion_tokens: model_entry.default_max_tokens,
            },
            timeout: Duration::from_secs(resolved.instance.timeout_secs),
            retry: RetryPolicy::default(),
        };

        let provider: Arc<dyn Provider> = match catalog.family() {
            "anthropic" => Arc::new(AnthropicProvider::new(settings)?),
            "openai" => Arc::new(OpenAiProvider::new(settings)?),
            "ollama" => Arc::new(OllamaProvider::new(settings)?),
            other => {
                return Err(Error::config(
                    format!("unknown provider family '{other}' in catalog '{catalog_id}'"),
                    "use one of: anthropic, openai, ollama",
                ));
            }
        };

        tracing::info!(
            instance = %instance_id,
            family = catalog.family(),
            model = %model_id,
            "provider created"
        );
        Ok((provider, model_id))
    }

    /// Probe connectivity and remote model availability for an instance.
    ///
    /// For a local runner the notes include a pull hint when the
    /// configured model is absent.
    pub async fn diagnose(&self, instance_id: &str, model: Option<&str>) -> Result<Diagnostics> {
        let resolved = self.resolve_instance(instance_id)?;
        let catalog_id = resolved.instance.catalog_provider_id.clone();
        let family = self
            .catalogs
            .get(&catalog_id)
            .map(|c| c.family().to_owned())
            .unwrap_or(catalog_id.clone());

        let mut notes = Vec::new();
        let mut available_models = Vec::new();
        let mut reachable = false;

        match family.as_str() {
            "ollama" => {
                let settings = AdapterSettings {
                    instance_id: resolved.id.clone(),
                    base_url: resolved.instance.endpoint.clone().unwrap_or_default(),
                    api_key: resolved.api_key.clone(),
                    model: model.unwrap_or("").to_owned(),
                    limits: HashMap::new(),
                    default_limits: ModelLimits::default(),
                    timeout: Duration::from_secs(10),
                    retry: RetryPolicy::default(),
                };
                let provider = OllamaProvider::new(settings)?;
                match provider.list_local_models().await {
                    Ok(models) => {
                        reachable = true;
                        if let Some(wanted) = model {
                            let present = models
                                .iter()
                                .any(|m| m == wanted || m.starts_with(&format!("{wanted}:")));
                            if !present {
                                notes.push(format!(
                                    "model '{wanted}' is not pulled; run `ollama pull {wanted}`"
                                ));
                            }
                        }
                        available_models = models;
                    }
                    Err(e) => {
                        notes.push(format!(
                            "runner unreachable: {} (is ollama serving at {}?)",
                            mask_secrets(&e.to_string()),
                            resolved
                                .instance
                                .endpoint
                                .as_deref()
                                .unwrap_or("http://localhost:11434"),
                        ));
                    }
                }
            }
            _ => {
                // Remote APIs: probe the models listing endpoint.
                let base = resolved.instance.endpoint.clone().unwrap_or_else(|| {
                    match family.as_str() {
                        "anthropic" => "https://api.anthropic.com".into(),
                        _ => "https://api.openai.com".into(),
                    }
                });
                let url = format!("{}/v1/models", base.trim_end_matches('/'));
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .map_err(|e| Error::Transient(e.to_string()))?;
                let request = if family == "anthropic" {
                    client
                        .get(&url)
                        .header("x-api-key", &resolved.api_key)
                        .header("anthropic-version", "2023-06-01")
                } else {
                    client.get(&url).bearer_auth(&resolved.api_key)
                };
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        reachable = true;
                        if let Ok(body) = resp.json::<serde_json::Value>().await {
                            available_models = body
                                .get("data")
                                .and_then(|d| d.as_array())
                                .map(|arr| {
                                    arr.iter()
                                        .filter_map(|m| m.get("id").and_then(|i| i.as_str()))
                                        .map(str::to_owned)
                                        .collect()
                                })
                                .unwrap_or_default();
                        }
                    }
                    Ok(resp) if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 => {
                        reachable = true;
                        notes.push(format!(
                            "authentication failed for instance '{instance_id}'; check {}",
                            self.home.credential_path(instance_id).display()
                        ));
                    }
                    Ok(resp) => {
                        reachable = true;
                        notes.push(format!("endpoint returned HTTP {}", resp.status().as_u16()));
                    }
                    Err(e) => {
                        notes.push(format!("endpoint unreachable: {}", mask_secrets(&e.to_string())));
                    }
                }
            }
        }

        Ok(Diagnostics {
            reachable,
            available_models,
            notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::Credential;

    fn registry_with(
        instances: &[(&str, &str)],
        credentials: &[&str],
    ) -> (tempfile::TempDir, ProviderRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let home = WeftHome::at(dir.path());
        home.ensure().unwrap();

        let mut file = InstancesFile::default();
        for (id, catalog) in instances {
            file.instances.insert(
                (*id).into(),
                ProviderInstance {
                    display_name: (*id).into(),
                    catalog_provider_id: (*catalog).into(),
                    endpoint: None,
                    timeout_secs: 30,
                },
            );
        }
        file.save(&home.instances_path()).unwrap();

        let store = CredentialStore::new(home.clone());
        for id in credentials {
            store
                .store(id, &Credential { api_key: "sk-test-key".into() })
                .unwrap();
        }

        (dir, ProviderRegistry::load(home).unwrap())
    }

    #[test]
    fn unknown_instance_is_config_error() {
        let (_dir, registry) = registry_with(&[], &[]);
        let err = registry.resolve_instance("ghost").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.display_message().contains("ghost"));
    }

    #[test]
    fn missing_credential_is_config_error() {
        let (_dir, registry) = registry_with(&[("anthropic-main", "anthropic")], &[]);
        let err = registry.resolve_instance("anthropic-main").unwrap_err();
        assert!(err.diagnostic().contains("apiKey"));
    }

    #[test]
    fn create_provider_validates_model_against_catalog() {
        let (_dir, registry) =
            registry_with(&[("anthropic-main", "anthropic")], &["anthropic-main"]);

        // In-catalog model succeeds.
        let (provider, model) = registry
            .create_provider("anthropic-main", Some("claude-sonnet-4-20250514"))
            .unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(model, "claude-sonnet-4-20250514");
        assert_eq!(provider.context_window(&model), 200_000);

        // Out-of-catalog model fails with the catalog's contents.
        let err = registry
            .create_provider("anthropic-main", Some("gpt-4o"))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.diagnostic().contains("claude-sonnet-4-20250514"));
    }

    #[test]
    fn create_provider_defaults_to_first_catalog_model() {
        let (_dir, registry) = registry_with(&[("openai-main", "openai")], &["openai-main"]);
        let (provider, model) = registry.create_provider("openai-main", None).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(model, "gpt-4o");
    }

    #[test]
    fn missing_catalog_is_config_error() {
        let (_dir, registry) = registry_with(&[("custom", "nonexistent")], &["custom"]);
        let err = registry.create_provider("custom", None).unwrap_err();
        assert!(err.display_message().contains("nonexistent"));
    }

    #[test]
    fn mask_secrets_hides_long_tokens() {
        let masked = mask_secrets("auth failed with key sk-ant-REDACTED");
        assert!(!masked.contains("sk-ant-REDACTED"));
        assert!(masked.contains("sk-a"));
    }

    #[test]
    fn mask_secrets_leaves_short_words() {
        assert_eq!(mask_secrets("connection refused"), "connection refused");
    }
}
