//! Shared test support: a scripted provider, canned tools, and event-log
//! assertions.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use weft_domain::{
    BoxStream, CancelToken, Error, EventPayload, Result, StreamEvent, ThreadEvent, ToolDefinition,
};
use weft_engine::{SessionCoordinator, TurnConfig};
use weft_providers::{collect_stream, CompletionRequest, Provider, ProviderResponse};
use weft_store::{Database, EventStore, ThreadManager};
use weft_tools::{AlwaysAllow, Tool, ToolInvocation, ToolResult};

/// One scripted provider response, consumed per model call.
#[derive(Debug)]
pub enum Scripted {
    /// Yield these events, then end the stream.
    Stream(Vec<StreamEvent>),
    /// Fail the call outright.
    Fail(Error),
    /// Yield these events, then hang until the cancel token fires.
    HangAfter(Vec<StreamEvent>),
}

/// A provider that replays a script, shared by streaming and
/// non-streaming paths, recording every request it sees.
#[derive(Debug)]
pub struct MockProvider {
    script: Mutex<VecDeque<Scripted>>,
    pub calls: AtomicU32,
    pub requests: Mutex<Vec<CompletionRequest>>,
    context_window: u32,
    max_completion: u32,
}

impl MockProvider {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            context_window: 200_000,
            max_completion: 8_192,
        })
    }

    /// A provider whose tiny prompt budget forces compaction.
    pub fn with_small_window(script: Vec<Scripted>, context_window: u32, max_completion: u32) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            context_window,
            max_completion,
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self, req: &CompletionRequest) -> Result<Scripted> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(req.clone());
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Other("mock script exhausted".into()))
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn context_window(&self, _model: &str) -> u32 {
        self.context_window
    }

    fn max_completion_tokens(&self, _model: &str) -> u32 {
        self.max_completion
    }

    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<ProviderResponse> {
        let stream = self.stream(req, cancel).await?;
        collect_stream(stream).await
    }

    async fn stream(
        &self,
        req: &CompletionRequest,
        _cancel: &CancelToken,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        match self.next(req)? {
            Scripted::Stream(events) => Ok(Box::pin(futures_util::stream::iter(
                events.into_iter().map(Ok),
            ))),
            Scripted::Fail(error) => Err(error),
            Scripted::HangAfter(events) => Ok(Box::pin(async_stream::stream! {
                for event in events {
                    yield Ok(event);
                }
                std::future::pending::<()>().await;
            })),
        }
    }
}

/// A tool that always returns the same text.
pub struct CannedTool {
    pub name: String,
    pub output: String,
}

#[async_trait::async_trait]
impl Tool for CannedTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: format!("canned tool '{}'", self.name),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    async fn run(&self, _invocation: ToolInvocation, _cancel: &CancelToken) -> Result<ToolResult> {
        Ok(ToolResult::text(self.output.clone()))
    }
}

/// A tool that fires the turn's cancel token while it runs, simulating a
/// user hitting stop mid-tool.
pub struct CancellingTool;

#[async_trait::async_trait]
impl Tool for CancellingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "pull_the_plug".into(),
            description: "cancels the running turn".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    async fn run(&self, _invocation: ToolInvocation, cancel: &CancelToken) -> Result<ToolResult> {
        cancel.cancel();
        Ok(ToolResult::text("plug pulled"))
    }
}

/// Build a session on an in-memory store around the given provider and
/// tools.
pub fn session_with(
    provider: Arc<MockProvider>,
    tools: Vec<Arc<dyn Tool>>,
    config: TurnConfig,
) -> (Arc<EventStore>, Arc<ThreadManager>, Arc<SessionCoordinator>) {
    let store = Arc::new(EventStore::new(Arc::new(Database::open_in_memory().unwrap())));
    let threads = Arc::new(ThreadManager::new(store.clone()));
    let session = SessionCoordinator::with_provider(
        store.clone(),
        threads.clone(),
        provider,
        "test-model",
        "test session",
        Arc::new(AlwaysAllow),
        config,
        tools,
    )
    .unwrap();
    (store, threads, session)
}

/// Payload kinds of a thread's raw events, in order.
pub fn kinds(events: &[ThreadEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.payload.kind()).collect()
}

/// Assert the tool-pairing invariant: every `ToolResult` pairs with a
/// prior `ToolCall`, and every `ToolCall` either has a result or is
/// followed by a local system message describing why it has none.
pub fn assert_tool_pairing(events: &[ThreadEvent]) {
    for (idx, event) in events.iter().enumerate() {
        match &event.payload {
            EventPayload::ToolResult { call_id, .. } => {
                let paired = events[..idx].iter().any(|prior| {
                    matches!(&prior.payload, EventPayload::ToolCall { call_id: prior_id, .. } if prior_id == call_id)
                });
                assert!(paired, "tool result '{call_id}' has no prior call");
            }
            EventPayload::ToolCall { call_id, .. } => {
                let resolved = events[idx..].iter().any(|later| {
                    matches!(&later.payload, EventPayload::ToolResult { call_id: later_id, .. } if later_id == call_id)
                }) || events[idx..].iter().any(|later| {
                    matches!(later.payload, EventPayload::LocalSystemMessage { .. })
                });
                assert!(resolved, "tool call '{call_id}' has neither result nor system note");
            }
            _ => {}
        }
    }
}

/// Shorthand for the text of an event, when it has one.
pub fn text_of(event: &ThreadEvent) -> Option<&str> {
    match &event.payload {
        EventPayload::UserMessage { text }
        | EventPayload::AgentMessage { text, .. }
        | EventPayload::Thinking { text }
        | EventPayload::LocalSystemMessage { text }
        | EventPayload::SystemPrompt { text } => Some(text),
        _ => None,
    }
}
