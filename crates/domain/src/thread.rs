//! Thread, session, and project records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ThreadId;

/// Display and routing metadata carried on a thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Provider instance hint for agents running on this thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Marks the coordinator thread of a session.
    #[serde(default)]
    pub is_session: bool,
    /// Marks a thread driven by an agent (coordinator or delegate).
    #[serde(default)]
    pub is_agent: bool,
}

/// A linear sequence of events identified by a [`ThreadId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ThreadId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: ThreadMetadata,
    /// Shadow threads hold summarized content spliced into another
    /// thread's effective event list at a compaction point.
    #[serde(default)]
    pub is_shadow: bool,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "archived" => Some(SessionStatus::Archived),
            _ => None,
        }
    }
}

/// Top-level container owning the coordinator agent (thread id equal to
/// the session id) plus any delegate agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub name: String,
    /// Opaque session configuration (provider instance, model, tool
    /// policy, …) owned by the coordinator.
    #[serde(default)]
    pub configuration: serde_json::Value,
    pub status: SessionStatus,
    /// Cumulative token counters across every turn of the session.
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A project groups sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
