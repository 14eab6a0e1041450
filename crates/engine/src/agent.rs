//! The per-agent state machine.
//!
//! An agent owns exactly one thread and processes at most one turn at a
//! time: a second `send_message` while a turn is running fails with
//! `Busy`. The state cell tracks where the active turn is
//! (`Thinking → Streaming → ToolExecuting → …`); the agent always
//! returns to `Idle` when the turn ends, whether it completed, failed,
//! or was cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use weft_domain::{CancelToken, Error, Result, ThreadId};
use weft_providers::Provider;
use weft_store::{EventStore, ThreadManager};
use weft_tools::{ApprovalGate, ToolExecutor};

use crate::events::TurnEvent;
use crate::turn::{run_turn, TurnConfig, TurnOutcome};

/// Where the active turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Thinking,
    Streaming,
    ToolExecuting,
}

#[derive(Clone)]
pub(crate) struct StateCell(Arc<Mutex<AgentState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(AgentState::Idle)))
    }

    pub(crate) fn set(&self, state: AgentState) {
        *self.0.lock() = state;
    }

    fn get(&self) -> AgentState {
        *self.0.lock()
    }
}

/// Everything a turn needs, shared by the agent and its delegates.
pub(crate) struct AgentShared {
    pub store: Arc<EventStore>,
    pub threads: Arc<ThreadManager>,
    pub provider: Arc<dyn Provider>,
    pub executor: Arc<ToolExecutor>,
    pub gate: Arc<dyn ApprovalGate>,
    pub model: String,
    pub config: TurnConfig,
    pub thread_id: ThreadId,
}

/// A single conversational agent bound to one thread.
pub struct Agent {
    shared: Arc<AgentShared>,
    state: StateCell,
    turn_lock: Arc<tokio::sync::Mutex<()>>,
    active: AtomicBool,
}

impl Agent {
    pub(crate) fn new(shared: AgentShared) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(shared),
            state: StateCell::new(),
            turn_lock: Arc::new(tokio::sync::Mutex::new(())),
            active: AtomicBool::new(true),
        })
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.shared.thread_id
    }

    pub fn state(&self) -> AgentState {
        self.state.get()
    }

    /// Whether a turn is currently running.
    pub fn is_busy(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Run one turn to completion.
    ///
    /// Fails immediately with [`Error::Busy`] if another turn is in
    /// flight on this agent.
    pub async fn send_message(&self, text: impl Into<String>, cancel: &CancelToken) -> Result<TurnOutcome> {
        if !self.is_active() {
            return Err(Error::config_bare(format!(
                "agent '{}' is stopped",
                self.shared.thread_id
            )));
        }
        let _guard = self
            .turn_lock
            .try_lock()
            .map_err(|_| Error::Busy(self.shared.thread_id.to_string()))?;

        let result = run_turn(&self.shared, &self.state, text.into(), cancel, None).await;
        self.state.set(AgentState::Idle);
        result
    }

    /// Run one turn in the background, streaming [`TurnEvent`]s.
    ///
    /// Returns the ephemeral event receiver plus a handle resolving to
    /// the turn outcome.
    pub fn send_message_streaming(
        self: &Arc<Self>,
        text: impl Into<String>,
        cancel: &CancelToken,
    ) -> (mpsc::Receiver<TurnEvent>, JoinHandle<Result<TurnOutcome>>) {
        let (tx, rx) = mpsc::channel(64);
        let agent = self.clone();
        let text = text.into();
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            if !agent.is_active() {
                let err = Error::config_bare(format!(
                    "agent '{}' is stopped",
                    agent.shared.thread_id
                ));
                let _ = tx
                    .send(TurnEvent::Error {
                        message: err.display_message(),
                    })
                    .await;
                return Err(err);
            }
            let Ok(_guard) = agent.turn_lock.try_lock() else {
                let err = Error::Busy(agent.shared.thread_id.to_string());
                let _ = tx
                    .send(TurnEvent::Error {
                        message: err.display_message(),
                    })
                    .await;
                return Err(err);
            };
            let result = run_turn(&agent.shared, &agent.state, text, &cancel, Some(&tx)).await;
            agent.state.set(AgentState::Idle);
            result
        });
        (rx, handle)
    }
}
