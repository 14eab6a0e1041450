//! Provider abstraction layer.
//!
//! One adapter per backend family (Anthropic, OpenAI-compatible, Ollama),
//! all satisfying the [`Provider`] trait: non-streaming and streaming
//! request paths, retry policy with the streaming first-byte guard, token
//! estimation, and stop-reason normalization. The registry resolves a
//! named provider instance (endpoint + credential + catalog entry) to a
//! live handle.

pub mod anthropic;
pub mod catalog;
pub mod estimate;
pub mod instances;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod traits;

pub use anthropic::AnthropicProvider;
pub use catalog::{Catalog, CatalogModel, CatalogSet};
pub use instances::{Credential, CredentialStore, InstancesFile, ProviderInstance};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use registry::{Diagnostics, ProviderRegistry};
pub use retry::RetryPolicy;
pub use traits::{
    collect_stream, AdapterSettings, CompletionRequest, ModelLimits, Performance, Provider,
    ProviderResponse,
};
