//! Ephemeral per-turn events for UIs.
//!
//! Streamed tokens never become log events; they flow through this
//! channel while the turn runs and are discarded afterwards. The event
//! log receives only the consolidated records.

use serde::Serialize;
use serde_json::Value;

use weft_domain::Usage;

/// Events emitted on the ephemeral channel during a single agent turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    /// Reasoning content from the model.
    #[serde(rename = "thinking")]
    Thinking { text: String },

    /// Incremental assistant text.
    #[serde(rename = "assistant_delta")]
    AssistantDelta { text: String },

    /// The model is invoking a tool.
    #[serde(rename = "tool_call")]
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },

    /// A tool finished.
    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        name: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// Provisional or final token usage.
    #[serde(rename = "usage")]
    Usage { usage: Usage, estimated: bool },

    /// The final assistant message of the turn.
    #[serde(rename = "final")]
    Final { text: String },

    /// The turn was stopped by cancellation; carries partial content.
    #[serde(rename = "stopped")]
    Stopped { partial: String },

    /// The turn failed.
    #[serde(rename = "error")]
    Error { message: String },
}
