//! Events emitted during model streaming (provider-agnostic).

use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage for a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Normalized reason a model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the response.
    Stop,
    /// Output cap reached.
    MaxTokens,
    /// The model wants tool results before continuing.
    ToolUse,
    /// Content was filtered by the backend.
    Filtered,
}

impl StopReason {
    /// Whether a turn ends at this stop reason (no further model calls).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StopReason::ToolUse)
    }
}

/// Events emitted while a provider response streams in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A reasoning chunk from a backend with native thinking support.
    #[serde(rename = "thinking")]
    Thinking { text: String },

    /// A text token chunk.
    #[serde(rename = "token")]
    Token { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, name: String },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call is complete with parsed arguments.
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// Provisional or authoritative usage counts mid-stream. Estimated
    /// updates are rate-limited by the adapter; the final counts in
    /// [`StreamEvent::Done`] supersede them.
    #[serde(rename = "usage_update")]
    UsageUpdate { usage: Usage, estimated: bool },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        stop_reason: StopReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_add_accumulates() {
        let mut total = Usage::new(10, 5);
        total.add(&Usage::new(3, 2));
        assert_eq!(total.prompt_tokens, 13);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 20);
    }

    #[test]
    fn tool_use_is_not_terminal() {
        assert!(!StopReason::ToolUse.is_terminal());
        assert!(StopReason::Stop.is_terminal());
        assert!(StopReason::MaxTokens.is_terminal());
        assert!(StopReason::Filtered.is_terminal());
    }

    #[test]
    fn stream_event_serializes_with_tag() {
        let event = StreamEvent::Done {
            usage: Some(Usage::new(1, 2)),
            stop_reason: StopReason::Stop,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "done");
        assert_eq!(value["stop_reason"], "stop");
    }
}
