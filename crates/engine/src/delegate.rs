//! The `delegate` tool.
//!
//! Lets an agent hand a sub-task to a subordinate agent on a child
//! thread. The child shares the parent's tool executor (so it can itself
//! delegate, bounded by the depth cap) and runs a complete turn; the
//! tool result carries `Thread: <child id>` so a UI can locate the
//! subtree. The parent blocks on the child only through this tool call,
//! and the parent's cancel token flows through, so cancelling the parent
//! cancels the delegate.

use std::sync::{Arc, Weak};

use weft_domain::{CancelToken, Error, Result, ToolDefinition};
use weft_providers::Provider;
use weft_store::{EventStore, ThreadManager};
use weft_tools::{ApprovalGate, Tool, ToolExecutor, ToolInvocation, ToolResult};

use crate::agent::{Agent, AgentShared};
use crate::turn::TurnConfig;

pub struct DelegateTool {
    store: Arc<EventStore>,
    threads: Arc<ThreadManager>,
    provider: Arc<dyn Provider>,
    /// Weak because the executor owns this tool.
    executor: Weak<ToolExecutor>,
    gate: Arc<dyn ApprovalGate>,
    model: String,
    config: TurnConfig,
}

impl DelegateTool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<EventStore>,
        threads: Arc<ThreadManager>,
        provider: Arc<dyn Provider>,
        executor: Weak<ToolExecutor>,
        gate: Arc<dyn ApprovalGate>,
        model: String,
        config: TurnConfig,
    ) -> Self {
        Self {
            store,
            threads,
            provider,
            executor,
            gate,
            model,
            config,
        }
    }
}

#[async_trait::async_trait]
impl Tool for DelegateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delegate".into(),
            description: "Delegate a sub-task to a subordinate agent running on its own \
                          thread. Returns the agent's final answer."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "The task for the subordinate agent.",
                    },
                    "name": {
                        "type": "string",
                        "description": "Optional display name for the delegate.",
                    },
                },
                "required": ["prompt"],
            }),
        }
    }

    async fn run(&self, invocation: ToolInvocation, cancel: &CancelToken) -> Result<ToolResult> {
        let Some(prompt) = invocation.call.arguments.get("prompt").and_then(|p| p.as_str())
        else {
            return Ok(ToolResult::error("delegate requires a 'prompt' argument"));
        };
        let name = invocation
            .call
            .arguments
            .get("name")
            .and_then(|n| n.as_str());

        if invocation.thread_id.depth() >= self.config.max_delegate_depth {
            return Ok(ToolResult::error(format!(
                "delegate depth limit ({}) reached",
                self.config.max_delegate_depth
            )));
        }

        let Some(executor) = self.executor.upgrade() else {
            return Ok(ToolResult::error("tool executor is shutting down"));
        };

        let child_id = self.threads.next_delegate_id(&invocation.thread_id, name)?;
        tracing::info!(
            parent = %invocation.thread_id,
            child = %child_id,
            "delegate spawned"
        );

        let child = Agent::new(AgentShared {
            store: self.store.clone(),
            threads: self.threads.clone(),
            provider: self.provider.clone(),
            executor,
            gate: self.gate.clone(),
            model: self.model.clone(),
            config: self.config.clone(),
            thread_id: child_id.clone(),
        });

        match child.send_message(prompt, cancel).await {
            Ok(outcome) => Ok(ToolResult::text(format!(
                "Thread: {child_id}\n\n{}",
                outcome.text
            ))),
            Err(Error::Cancelled) => Ok(ToolResult::error(format!(
                "Thread: {child_id}\n\ndelegate cancelled"
            ))),
            Err(e) => Ok(ToolResult::error(format!(
                "Thread: {child_id}\n\ndelegate failed: {}",
                e.diagnostic()
            ))),
        }
    }
}
