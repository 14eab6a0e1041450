//! Shared domain types for the weft agent runtime.
//!
//! Everything here is provider- and storage-agnostic: thread/event records,
//! the provider-neutral message format, streaming events, cancellation
//! tokens, the workspace error type, and home-directory resolution.

pub mod cancel;
pub mod error;
pub mod event;
pub mod home;
pub mod id;
pub mod message;
pub mod stream;
pub mod thread;

pub use cancel::{CancelMap, CancelToken};
pub use error::{Error, Result};
pub use event::{ContentBlock, EventId, EventPayload, ThreadEvent};
pub use id::ThreadId;
pub use message::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
pub use stream::{BoxStream, StopReason, StreamEvent, Usage};
pub use thread::{Project, Session, SessionStatus, Thread, ThreadMetadata};
