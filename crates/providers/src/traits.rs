use std::collections::HashMap;
use std::time::Duration;

use weft_domain::{
    BoxStream, CancelToken, Error, Message, Result, StopReason, StreamEvent, ToolCall,
    ToolDefinition, Usage,
};

use crate::retry::RetryPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// System prompt. Adapters place it wherever their backend expects it.
    pub system: Option<String>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Model identifier override. When `None`, the adapter uses its
    /// configured model.
    pub model: Option<String>,
    /// Maximum tokens in the response. When `None`, the adapter uses the
    /// catalog default.
    pub max_tokens: Option<u32>,
    /// Sampling temperature. `None` lets the backend choose.
    pub temperature: Option<f32>,
}

/// Wall-clock performance of a completed call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Performance {
    pub elapsed_ms: u64,
    /// Time until the first streamed event, when streaming.
    pub first_token_ms: Option<u64>,
}

/// A provider-agnostic completion response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Assembled text content.
    pub content: String,
    /// Reasoning content, for backends with native thinking support.
    pub thinking: String,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Normalized reason the model stopped.
    pub stop_reason: StopReason,
    /// Token usage, when the backend reported it.
    pub usage: Option<Usage>,
    /// Timing, when measured.
    pub performance: Option<Performance>,
}

/// Context window and output cap for one model, resolved from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub context_window: u32,
    pub max_completion_tokens: u32,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            max_completion_tokens: 4_096,
        }
    }
}

/// Everything an adapter needs, resolved by the registry from the
/// instance record, its credential, and the catalog.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Instance id, used in error messages and logging.
    pub instance_id: String,
    /// Base URL. Empty means the adapter's default endpoint.
    pub base_url: String,
    pub api_key: String,
    /// Default model for requests that do not override it.
    pub model: String,
    /// Per-model limits from the catalog.
    pub limits: HashMap<String, ModelLimits>,
    /// Fallback for models absent from `limits`.
    pub default_limits: ModelLimits,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl AdapterSettings {
    pub fn limits_for(&self, model: &str) -> ModelLimits {
        self.limits.get(model).copied().unwrap_or(self.default_limits)
    }

    /// Minimal settings for unit tests: no network use is implied.
    pub fn for_tests(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.into(),
            base_url: String::new(),
            api_key: "test-key".into(),
            model: "test-model".into(),
            limits: HashMap::new(),
            default_limits: ModelLimits::default(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every backend adapter must implement.
///
/// Implementations translate between the internal types and the wire
/// format of each backend's HTTP API. Handles are safe for concurrent use
/// across turns; the underlying client pools connections.
#[async_trait::async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Stable identifier of the backend family ("anthropic", "openai",
    /// "ollama").
    fn name(&self) -> &str;

    /// Context window of `model` in tokens.
    fn context_window(&self, model: &str) -> u32;

    /// Output token cap of `model`.
    fn max_completion_tokens(&self, model: &str) -> u32;

    /// Send a completion request and wait for the full response.
    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<ProviderResponse>;

    /// Send a completion request and return a stream of events ending in
    /// a single [`StreamEvent::Done`].
    async fn stream(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}

/// Fold a finished stream into a [`ProviderResponse`].
///
/// The streaming and non-streaming paths must produce identical content;
/// this is the canonical assembly both the engine and the equivalence
/// tests use.
pub async fn collect_stream(
    mut stream: BoxStream<'static, Result<StreamEvent>>,
) -> Result<ProviderResponse> {
    use futures_util::StreamExt;

    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut open_calls: HashMap<String, (String, String)> = HashMap::new();
    let mut usage: Option<Usage> = None;
    let mut stop_reason = StopReason::Stop;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Token { text } => content.push_str(&text),
            StreamEvent::Thinking { text } => thinking.push_str(&text),
            StreamEvent::ToolCallStarted { call_id, name } => {
                open_calls.insert(call_id, (name, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, args)) = open_calls.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                name,
                arguments,
            } => {
                open_calls.remove(&call_id);
                tool_calls.push(ToolCall {
                    call_id,
                    name,
                    arguments,
                });
            }
            StreamEvent::UsageUpdate {
                usage: update,
                estimated,
            } => {
                // Provisional estimates never overwrite authoritative
                // counts.
                if !estimated || usage.is_none() {
                    usage = Some(update);
                }
            }
            StreamEvent::Done {
                usage: final_usage,
                stop_reason: reason,
            } => {
                if final_usage.is_some() {
                    usage = final_usage;
                }
                stop_reason = reason;
            }
        }
    }

    // A call that saw start/delta but no finish means the backend closed
    // the stream mid-assembly: parse what accumulated, and fail the turn
    // if it is not valid JSON.
    for (call_id, (name, args)) in open_calls {
        let arguments = if args.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&args).map_err(|e| {
                Error::Protocol(format!(
                    "tool call '{call_id}' ({name}) arguments are not valid JSON: {e}"
                ))
            })?
        };
        tool_calls.push(ToolCall {
            call_id,
            name,
            arguments,
        });
    }

    Ok(ProviderResponse {
        content,
        thinking,
        tool_calls,
        stop_reason,
        usage,
        performance: None,
    })
}
