//! The agent turn engine and session coordinator.
//!
//! An [`Agent`] drives a per-turn state machine over one thread:
//! reconstruct the conversation from the event log, stream a model
//! response, append the consolidated events, dispatch tool calls, and
//! loop until a terminal stop reason. The [`SessionCoordinator`] owns a
//! set of agents sharing one tool executor, spawns delegates, and
//! persists the session record.

pub mod agent;
pub mod compact;
pub mod conversation;
pub mod delegate;
pub mod events;
pub mod metrics;
pub mod session;
pub mod turn;

pub use agent::{Agent, AgentState};
pub use delegate::DelegateTool;
pub use events::TurnEvent;
pub use metrics::TurnMetrics;
pub use session::SessionCoordinator;
pub use turn::{CompactionConfig, TurnConfig, TurnOutcome};
