//! The tool executor.
//!
//! Name-unique registry plus dispatch. `execute` never returns an error:
//! unknown tools, policy denials, cancellations, and tool faults all
//! come back as error-flagged [`ToolResult`]s so they stay part of the
//! event log.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use weft_domain::{CancelToken, Error, Result, ThreadId, ToolCall, ToolDefinition};

use crate::approval::{ApprovalGate, ApprovalPolicy, ReviewDecision};
use crate::{Tool, ToolInvocation, ToolResult};

/// Registry of tool implementations shared by every agent of a session.
///
/// The registry is populated at startup and read-only afterwards;
/// per-invocation state lives on the calling turn's stack.
pub struct ToolExecutor {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Names are unique; a duplicate is a configuration
    /// error.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.definition().name;
        let mut tools = self.tools.write();
        if tools.contains_key(&name) {
            return Err(Error::config_bare(format!(
                "tool '{name}' is already registered"
            )));
        }
        tracing::debug!(tool = %name, "tool registered");
        tools.insert(name, tool);
        Ok(())
    }

    /// Schemas of every registered tool, sorted by name, for the
    /// provider request.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .values()
            .map(|t| t.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Dispatch one tool call.
    ///
    /// Consults the approval gate; on `RequireApproval` awaits a binary
    /// decision. Every failure mode is folded into the result's
    /// `is_error` flag.
    pub async fn execute(
        &self,
        thread_id: &ThreadId,
        call: &ToolCall,
        gate: &dyn ApprovalGate,
        cancel: &CancelToken,
    ) -> ToolResult {
        let Some(tool) = self.tools.read().get(&call.name).cloned() else {
            return ToolResult::error(format!("tool '{}' is not registered", call.name));
        };

        match gate.policy(call) {
            ApprovalPolicy::Deny => {
                tracing::info!(tool = %call.name, call_id = %call.call_id, "tool call denied by policy");
                return ToolResult::error(format!("tool '{}' denied by policy", call.name));
            }
            ApprovalPolicy::RequireApproval => match gate.review(call).await {
                ReviewDecision::Approved => {}
                ReviewDecision::Denied { reason } => {
                    return ToolResult::error(match reason {
                        Some(reason) => format!("tool '{}' denied: {reason}", call.name),
                        None => format!("tool '{}' denied", call.name),
                    });
                }
            },
            ApprovalPolicy::Allow => {}
        }

        if cancel.is_cancelled() {
            return ToolResult::error(format!(
                "tool '{}' not executed: turn cancelled",
                call.name
            ));
        }

        let invocation = ToolInvocation {
            call: call.clone(),
            thread_id: thread_id.clone(),
        };
        let started = std::time::Instant::now();
        let result = match tool.run(invocation, cancel).await {
            Ok(result) => result,
            Err(Error::Cancelled) => {
                ToolResult::error(format!("tool '{}' cancelled", call.name))
            }
            Err(e) => ToolResult::error(format!("tool '{}' failed: {e}", call.name)),
        };
        tracing::debug!(
            tool = %call.name,
            call_id = %call.call_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_error = result.is_error,
            "tool call finished"
        );
        result
    }
}
