//! Model catalogs.
//!
//! One document per catalog provider id, enumerating the models an
//! instance may use along with their context windows and default output
//! caps. Built-in catalogs cover the three adapter families; documents in
//! `user-catalog/` extend or override them.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use weft_domain::home::WeftHome;
use weft_domain::{Error, Result};

use crate::traits::ModelLimits;

/// One model entry in a catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub context_window: u32,
    pub default_max_tokens: u32,
}

/// The model catalog of one provider family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub id: String,
    /// Adapter family ("anthropic", "openai", "ollama"). Defaults to the
    /// catalog id, so a user catalog like `together` can declare
    /// `"family": "openai"`.
    #[serde(default)]
    pub family: Option<String>,
    pub models: Vec<CatalogModel>,
}

impl Catalog {
    pub fn family(&self) -> &str {
        self.family.as_deref().unwrap_or(&self.id)
    }

    pub fn model(&self, model_id: &str) -> Option<&CatalogModel> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// Per-model limits map for adapter settings.
    pub fn limits(&self) -> HashMap<String, ModelLimits> {
        self.models
            .iter()
            .map(|m| {
                (
                    m.id.clone(),
                    ModelLimits {
                        context_window: m.context_window,
                        max_completion_tokens: m.default_max_tokens,
                    },
                )
            })
            .collect()
    }

    /// The first model, used when a request does not name one.
    pub fn default_model(&self) -> Option<&CatalogModel> {
        self.models.first()
    }
}

/// All catalogs known to a registry: built-ins overlaid with user
/// documents.
#[derive(Debug, Clone)]
pub struct CatalogSet {
    catalogs: HashMap<String, Catalog>,
}

impl CatalogSet {
    /// Built-in catalogs only.
    pub fn builtin() -> Self {
        let mut catalogs = HashMap::new();
        for catalog in [builtin_anthropic(), builtin_openai(), builtin_ollama()] {
            catalogs.insert(catalog.id.clone(), catalog);
        }
        Self { catalogs }
    }

    /// Built-ins overlaid with every document in the user catalog
    /// directory. A user document with a built-in's id replaces it.
    pub fn load(home: &WeftHome) -> Result<Self> {
        let mut set = Self::builtin();
        let dir = home.user_catalog_dir();
        if !dir.is_dir() {
            return Ok(set);
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let catalog = Self::load_document(&path)?;
            set.catalogs.insert(catalog.id.clone(), catalog);
        }
        Ok(set)
    }

    fn load_document(path: &Path) -> Result<Catalog> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::config(
                format!("unreadable catalog document: {e}"),
                format!("fix or remove {}", path.display()),
            )
        })
    }

    pub fn get(&self, catalog_provider_id: &str) -> Option<&Catalog> {
        self.catalogs.get(catalog_provider_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in catalogs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn model(id: &str, context_window: u32, default_max_tokens: u32) -> CatalogModel {
    CatalogModel {
        id: id.into(),
        display_name: None,
        context_window,
        default_max_tokens,
    }
}

fn builtin_anthropic() -> Catalog {
    Catalog {
        id: "anthropic".into(),
        family: None,
        models: vec![
            model("claude-sonnet-4-20250514", 200_000, 8_192),
            model("claude-opus-4-20250514", 200_000, 8_192),
            model("claude-3-5-haiku-20241022", 200_000, 8_192),
        ],
    }
}

fn builtin_openai() -> Catalog {
    Catalog {
        id: "openai".into(),
        family: None,
        models: vec![
            model("gpt-4o", 128_000, 16_384),
            model("gpt-4o-mini", 128_000, 16_384),
            model("gpt-4.1", 1_047_576, 32_768),
        ],
    }
}

fn builtin_ollama() -> Catalog {
    Catalog {
        id: "ollama".into(),
        family: None,
        models: vec![
            model("llama3.2", 128_000, 4_096),
            model("qwen2.5-coder", 32_768, 4_096),
        ],
    }
}
