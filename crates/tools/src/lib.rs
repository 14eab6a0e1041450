//! Tool registry and dispatch.
//!
//! Tools are the only way a model acts on the world. The executor routes
//! tool-call requests, enforces the approval policy, and serializes
//! outcomes as structured content blocks. Tool failures never propagate
//! as errors: they become error-flagged results in the event log, and
//! the model decides how to react.

pub mod approval;
pub mod executor;

use weft_domain::{CancelToken, ContentBlock, Result, ThreadId, ToolCall, ToolDefinition};

pub use approval::{
    AlwaysAllow, ApprovalGate, ApprovalInfo, ApprovalPolicy, PendingApprovals, ReviewDecision,
    StaticGate,
};
pub use executor::ToolExecutor;

/// The outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: true,
        }
    }

    /// Plain-text rendering of all content blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Context a tool receives about the call site.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub call: ToolCall,
    /// The thread whose turn issued this call.
    pub thread_id: ThreadId,
}

/// A tool implementation.
///
/// `run` returns `Err` only for infrastructure faults; domain-level
/// failures (bad arguments, command failed) should be `Ok` with an
/// error-flagged result. Either way the executor folds the outcome into
/// a [`ToolResult`].
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn run(&self, invocation: ToolInvocation, cancel: &CancelToken) -> Result<ToolResult>;
}
