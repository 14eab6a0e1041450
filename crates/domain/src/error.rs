//! Shared error type used across all weft crates.
//!
//! One enum, one kind per failure class the runtime distinguishes. Tool
//! failures are deliberately absent: they are data (`ToolResult` with
//! `is_error`), not errors, so the model can react to them.

/// Shared error type used across all weft crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Recoverable network / 5xx / overload failures. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Authentication or permission failure. Never retried.
    #[error("auth ({instance}): {message}")]
    Auth { instance: String, message: String },

    /// Missing instance, missing credential, model not in catalog.
    /// Carries a remediation hint for the operator.
    #[error("config: {message}")]
    Config {
        message: String,
        remediation: Option<String>,
    },

    /// Malformed response from a provider (e.g. unparseable tool-call
    /// arguments at stream end).
    #[error("protocol: {0}")]
    Protocol(String),

    /// The operation was deliberately cancelled. Distinct from failure.
    #[error("cancelled")]
    Cancelled,

    /// A second concurrent turn was attempted on a busy agent.
    #[error("agent {0} is busy with another turn")]
    Busy(String),

    /// The summarization call behind a compaction failed.
    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    /// An append would have broken an event-log invariant. Should never
    /// occur in normal operation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Disk / database failure in the event store.
    #[error("storage: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the failed operation might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Build a config error with a remediation hint.
    pub fn config(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            remediation: Some(remediation.into()),
        }
    }

    /// Build a config error without a remediation hint.
    pub fn config_bare(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            remediation: None,
        }
    }

    /// Short display message suitable for a status line.
    pub fn display_message(&self) -> String {
        match self {
            Error::Auth { instance, .. } => {
                format!("authentication failed for provider instance '{instance}'")
            }
            Error::Config { message, .. } => message.clone(),
            Error::Transient(_) => "temporary provider failure".into(),
            Error::Cancelled => "cancelled".into(),
            other => other.to_string(),
        }
    }

    /// Longer diagnostic, including remediation when available.
    pub fn diagnostic(&self) -> String {
        match self {
            Error::Config {
                message,
                remediation: Some(fix),
            } => format!("{message} ({fix})"),
            other => other.to_string(),
        }
    }
}
