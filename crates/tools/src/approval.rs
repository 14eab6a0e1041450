//! Tool approval workflow.
//!
//! The executor consults an [`ApprovalGate`] before every invocation.
//! `Allow` and `Deny` resolve immediately; `RequireApproval` suspends the
//! turn until a human answers (or a timeout fires). The gate is a
//! capability handed to the executor per execution — policy state lives
//! with the session, never with the executor.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use uuid::Uuid;

use weft_domain::{CancelToken, ToolCall};

/// The policy decision for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    Allow,
    RequireApproval,
    Deny,
}

/// Outcome of a `RequireApproval` review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    Denied { reason: Option<String> },
}

/// Capability consulted by the executor for every tool call.
#[async_trait::async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Classify the call.
    fn policy(&self, call: &ToolCall) -> ApprovalPolicy;

    /// Await a binary decision for a `RequireApproval` call. The default
    /// denies, so a gate that never classifies calls as
    /// `RequireApproval` does not need to implement it.
    async fn review(&self, _call: &ToolCall) -> ReviewDecision {
        ReviewDecision::Denied {
            reason: Some("no reviewer available".into()),
        }
    }
}

/// Gate that allows everything. The default for non-interactive use and
/// tests.
pub struct AlwaysAllow;

#[async_trait::async_trait]
impl ApprovalGate for AlwaysAllow {
    fn policy(&self, _call: &ToolCall) -> ApprovalPolicy {
        ApprovalPolicy::Allow
    }
}

/// Gate with a fixed policy per tool name, used by sessions to encode
/// their tool policy and by tests to script denials.
pub struct StaticGate {
    default: ApprovalPolicy,
    per_tool: HashMap<String, ApprovalPolicy>,
}

impl StaticGate {
    pub fn new(default: ApprovalPolicy) -> Self {
        Self {
            default,
            per_tool: HashMap::new(),
        }
    }

    pub fn with_tool(mut self, name: &str, policy: ApprovalPolicy) -> Self {
        self.per_tool.insert(name.to_owned(), policy);
        self
    }
}

#[async_trait::async_trait]
impl ApprovalGate for StaticGate {
    fn policy(&self, call: &ToolCall) -> ApprovalPolicy {
        self.per_tool
            .get(&call.name)
            .copied()
            .unwrap_or(self.default)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending approvals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A pending approval waiting for review.
pub struct PendingApproval {
    pub id: Uuid,
    pub call: ToolCall,
    pub created_at: DateTime<Utc>,
    respond: oneshot::Sender<ReviewDecision>,
}

/// Snapshot of a pending approval for UIs.
#[derive(Debug, Clone)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub call: ToolCall,
    pub created_at: DateTime<Utc>,
}

/// Store wiring `RequireApproval` reviews to an external answerer.
///
/// `wait` registers the call and suspends until `approve`/`deny` resolves
/// it, the timeout elapses, or the cancel token fires; the latter two
/// resolve to denial so a pending approval can never wedge a turn.
pub struct PendingApprovals {
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
    timeout: Duration,
}

impl PendingApprovals {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn list(&self) -> Vec<ApprovalInfo> {
        self.pending
            .read()
            .values()
            .map(|p| ApprovalInfo {
                id: p.id,
                call: p.call.clone(),
                created_at: p.created_at,
            })
            .collect()
    }

    pub fn approve(&self, id: &Uuid) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ReviewDecision::Approved);
            return true;
        }
        false
    }

    pub fn deny(&self, id: &Uuid, reason: Option<String>) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ReviewDecision::Denied { reason });
            return true;
        }
        false
    }

    /// Register `call` and await its decision.
    pub async fn wait(&self, call: &ToolCall, cancel: &CancelToken) -> ReviewDecision {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.pending.write().insert(
            id,
            PendingApproval {
                id,
                call: call.clone(),
                created_at: Utc::now(),
                respond: tx,
            },
        );

        let decision = tokio::select! {
            decision = rx => decision.ok(),
            _ = tokio::time::sleep(self.timeout) => None,
            _ = cancel.cancelled() => {
                self.pending.write().remove(&id);
                return ReviewDecision::Denied {
                    reason: Some("cancelled while awaiting approval".into()),
                };
            }
        };

        match decision {
            Some(decision) => decision,
            None => {
                self.pending.write().remove(&id);
                tracing::warn!(call_id = %call.call_id, tool = %call.name, "approval timed out");
                ReviewDecision::Denied {
                    reason: Some("approval timed out".into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn call(name: &str) -> ToolCall {
        ToolCall {
            call_id: "c1".into(),
            name: name.into(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn static_gate_per_tool_overrides_default() {
        let gate = StaticGate::new(ApprovalPolicy::Allow)
            .with_tool("bash", ApprovalPolicy::RequireApproval)
            .with_tool("rm", ApprovalPolicy::Deny);
        assert_eq!(gate.policy(&call("read_file")), ApprovalPolicy::Allow);
        assert_eq!(gate.policy(&call("bash")), ApprovalPolicy::RequireApproval);
        assert_eq!(gate.policy(&call("rm")), ApprovalPolicy::Deny);
    }

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let store = Arc::new(PendingApprovals::new(Duration::from_secs(30)));
        let waiter = store.clone();
        let handle =
            tokio::spawn(async move { waiter.wait(&call("bash"), &CancelToken::new()).await });

        // Wait for registration, then approve.
        let id = loop {
            if let Some(info) = store.list().first() {
                break info.id;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        assert!(store.approve(&id));
        assert_eq!(handle.await.unwrap(), ReviewDecision::Approved);
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn deny_carries_reason() {
        let store = Arc::new(PendingApprovals::new(Duration::from_secs(30)));
        let waiter = store.clone();
        let handle =
            tokio::spawn(async move { waiter.wait(&call("bash"), &CancelToken::new()).await });

        let id = loop {
            if let Some(info) = store.list().first() {
                break info.id;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        assert!(store.deny(&id, Some("too dangerous".into())));
        match handle.await.unwrap() {
            ReviewDecision::Denied { reason } => {
                assert_eq!(reason.as_deref(), Some("too dangerous"));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_denies() {
        let store = PendingApprovals::new(Duration::from_millis(5));
        let decision = store.wait(&call("bash"), &CancelToken::new()).await;
        assert!(matches!(decision, ReviewDecision::Denied { .. }));
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn cancel_denies_and_cleans_up() {
        let store = PendingApprovals::new(Duration::from_secs(30));
        let cancel = CancelToken::new();
        cancel.cancel();
        let decision = store.wait(&call("bash"), &cancel).await;
        match decision {
            ReviewDecision::Denied { reason } => {
                assert!(reason.unwrap().contains("cancelled"));
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(store.list().is_empty());
    }

    #[test]
    fn approve_unknown_returns_false() {
        let store = PendingApprovals::new(Duration::from_secs(1));
        assert!(!store.approve(&Uuid::new_v4()));
        assert!(!store.deny(&Uuid::new_v4(), None));
    }
}
