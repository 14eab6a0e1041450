//! SQLite-backed persistence for weft.
//!
//! The event store is the sole source of truth for every conversation:
//! an append-only log keyed by thread id with a publish/subscribe surface,
//! plus thread/session/project records. The thread manager layers the
//! hierarchy and compaction splicing on top.

mod db;
mod events;
mod sessions;
mod threads;

pub use db::Database;
pub use events::{EventStore, StoredEvent, Subscription};
pub use threads::ThreadManager;
