//! Immutable thread events — the unit of record for every conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ThreadId;
use crate::stream::Usage;

/// Unique event identifier (unique within a thread; in practice globally
/// unique since it is a v4 UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed content block inside a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// The plain-text rendering of this block.
    pub fn as_text(&self) -> &str {
        match self {
            ContentBlock::Text { text } => text,
        }
    }
}

/// Type-dependent payload of a [`ThreadEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// Text from a human.
    #[serde(rename = "user_message")]
    UserMessage { text: String },

    /// Text from the model. May contain embedded `<think>…</think>`
    /// segments, which are stripped before replay.
    #[serde(rename = "agent_message")]
    AgentMessage {
        text: String,
        /// Final usage counts for the model call that produced this
        /// message, when the provider reported them.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// Standalone reasoning segment captured from streaming. Never
    /// replayed to the model.
    #[serde(rename = "thinking")]
    Thinking { text: String },

    /// A tool invocation requested by the model.
    #[serde(rename = "tool_call")]
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// The outcome of a tool invocation.
    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
    },

    /// Operator-level text recorded for the log but not replayed as
    /// conversation.
    #[serde(rename = "local_system_message")]
    LocalSystemMessage { text: String },

    /// The system prompt in effect, recorded but not replayed as
    /// conversation.
    #[serde(rename = "system_prompt")]
    SystemPrompt { text: String },

    /// Marks a compaction boundary. Reads splice the shadow thread's
    /// events in as a prefix of everything after this marker.
    #[serde(rename = "compaction")]
    Compaction { shadow_thread_id: ThreadId },
}

impl EventPayload {
    /// Stable type tag, used as the `type` column in storage.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::UserMessage { .. } => "user_message",
            EventPayload::AgentMessage { .. } => "agent_message",
            EventPayload::Thinking { .. } => "thinking",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::LocalSystemMessage { .. } => "local_system_message",
            EventPayload::SystemPrompt { .. } => "system_prompt",
            EventPayload::Compaction { .. } => "compaction",
        }
    }
}

/// An immutable record in a thread's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEvent {
    pub id: EventId,
    pub thread_id: ThreadId,
    /// Non-decreasing within a thread.
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl ThreadEvent {
    /// Build a new event for `thread_id` stamped with the current time.
    pub fn new(thread_id: ThreadId, payload: EventPayload) -> Self {
        Self {
            id: EventId::generate(),
            thread_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}
