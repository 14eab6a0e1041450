//! Turn execution — the inner loop that streams model responses,
//! consolidates them into events, dispatches tool calls, and repeats
//! until a terminal stop reason.
//!
//! The engine is the only component that appends model-originated events.
//! Streamed tokens flow to the ephemeral [`TurnEvent`] channel; the log
//! receives exactly one `AgentMessage` per model call, followed by the
//! `ToolCall` events observed in that response.

use futures_util::StreamExt;
use tokio::sync::mpsc;

use weft_domain::{
    CancelToken, Error, EventPayload, Result, StopReason, StreamEvent, ThreadEvent, ToolCall, Usage,
};
use weft_providers::CompletionRequest;

use crate::agent::{AgentShared, AgentState, StateCell};
use crate::compact;
use crate::conversation;
use crate::events::TurnEvent;
use crate::metrics::TurnMetrics;

/// Safety cap on model-call rounds within one turn.
const DEFAULT_MAX_TOOL_LOOPS: usize = 25;

/// Compaction thresholds.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Fraction of the prompt budget (context window minus output cap)
    /// at which compaction triggers.
    pub high_water_ratio: f32,
    /// User-message turns kept verbatim out of the summary.
    pub keep_recent_turns: usize,
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_water_ratio: 0.85,
            keep_recent_turns: 1,
            summary_max_tokens: 2_000,
        }
    }
}

/// Per-agent turn configuration.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub system_prompt: Option<String>,
    pub max_tool_loops: usize,
    /// Dispatch tool calls concurrently instead of in emission order.
    /// Results are keyed by call id either way.
    pub parallel_tools: bool,
    /// How deep delegate agents may nest.
    pub max_delegate_depth: u32,
    pub compaction: CompactionConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tool_loops: DEFAULT_MAX_TOOL_LOOPS,
            parallel_tools: false,
            max_delegate_depth: 3,
            compaction: CompactionConfig::default(),
        }
    }
}

/// What a completed turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final assistant text.
    pub text: String,
    pub stop_reason: StopReason,
    /// Cumulative usage across every model call of the turn.
    pub usage: Usage,
    pub metrics: TurnMetrics,
}

async fn emit(events: Option<&mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Append a local system message; storage failures here are logged, not
/// propagated, so they cannot mask the original failure.
fn append_note(shared: &AgentShared, text: String) {
    let event = ThreadEvent::new(
        shared.thread_id.clone(),
        EventPayload::LocalSystemMessage { text },
    );
    if let Err(e) = shared.store.append(event) {
        tracing::error!(thread = %shared.thread_id, error = %e, "failed to record system message");
    }
}

/// Surface a turn failure: record it in the log, notify the channel,
/// and propagate the error to the caller.
async fn fail(
    shared: &AgentShared,
    events: Option<&mpsc::Sender<TurnEvent>>,
    error: Error,
) -> Result<TurnOutcome> {
    append_note(shared, format!("Turn failed: {}", error.diagnostic()));
    emit(
        events,
        TurnEvent::Error {
            message: error.display_message(),
        },
    )
    .await;
    Err(error)
}

/// Exit a cancelled turn, leaving the log well-formed.
async fn cancelled_exit(
    shared: &AgentShared,
    events: Option<&mpsc::Sender<TurnEvent>>,
    partial: &str,
    note: String,
) -> Result<TurnOutcome> {
    append_note(shared, note);
    emit(
        events,
        TurnEvent::Stopped {
            partial: partial.to_owned(),
        },
    )
    .await;
    Err(Error::Cancelled)
}

/// Run one turn: append the user message, then alternate model calls and
/// tool dispatch until a terminal stop reason, cancellation, or failure.
pub(crate) async fn run_turn(
    shared: &AgentShared,
    state: &StateCell,
    text: String,
    cancel: &CancelToken,
    events: Option<&mpsc::Sender<TurnEvent>>,
) -> Result<TurnOutcome> {
    let thread_id = shared.thread_id.clone();
    let mut metrics = TurnMetrics::start();

    tracing::debug!(thread = %thread_id, "turn started");

    shared.store.append(ThreadEvent::new(
        thread_id.clone(),
        EventPayload::UserMessage { text },
    ))?;

    let tool_defs = shared.executor.schemas();

    for loop_idx in 0..shared.config.max_tool_loops {
        if cancel.is_cancelled() {
            return cancelled_exit(shared, events, "", "Turn cancelled by user.".into()).await;
        }

        state.set(AgentState::Thinking);

        // ── Conversation + prompt budget ──────────────────────────
        let mut log = shared.threads.effective_events(&thread_id)?;
        let mut messages = conversation::build_messages(&log);
        if compact::over_budget(shared, &messages) {
            match compact::run_compaction(shared, cancel).await {
                Ok(true) => {
                    log = shared.threads.effective_events(&thread_id)?;
                    messages = conversation::build_messages(&log);
                }
                Ok(false) => {}
                Err(e) => return fail(shared, events, e).await,
            }
        }
        drop(log);

        let request = CompletionRequest {
            messages,
            system: shared.config.system_prompt.clone(),
            tools: tool_defs.clone(),
            model: Some(shared.model.clone()),
            max_tokens: None,
            temperature: None,
        };

        // ── Model call ────────────────────────────────────────────
        tracing::debug!(thread = %thread_id, loop_idx, model = %shared.model, "model call");
        metrics.record_model_call();
        let mut stream = match shared.provider.stream(&request, cancel).await {
            Ok(stream) => stream,
            Err(Error::Cancelled) => {
                return cancelled_exit(shared, events, "", "Turn cancelled by user.".into()).await;
            }
            Err(e) => return fail(shared, events, e).await,
        };

        state.set(AgentState::Streaming);
        let mut text_buf = String::new();
        let mut thinking_buf = String::new();
        let mut finished_calls: Vec<ToolCall> = Vec::new();
        // Calls that saw start/delta but no finish, in emission order.
        let mut open_calls: Vec<(String, String, String)> = Vec::new();
        let mut call_usage: Option<Usage> = None;
        let mut stop_reason = StopReason::Stop;
        let mut was_cancelled = false;

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => {
                    was_cancelled = true;
                    break;
                }
            };
            let Some(event) = next else { break };

            match event {
                Ok(StreamEvent::Token { text }) => {
                    metrics.record_first_token();
                    text_buf.push_str(&text);
                    emit(events, TurnEvent::AssistantDelta { text }).await;
                }
                Ok(StreamEvent::Thinking { text }) => {
                    metrics.record_first_token();
                    thinking_buf.push_str(&text);
                    emit(events, TurnEvent::Thinking { text }).await;
                }
                Ok(StreamEvent::ToolCallStarted { call_id, name }) => {
                    open_calls.push((call_id, name, String::new()));
                }
                Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                    if let Some(open) = open_calls.iter_mut().find(|c| c.0 == call_id) {
                        open.2.push_str(&delta);
                    }
                }
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    name,
                    arguments,
                }) => {
                    open_calls.retain(|c| c.0 != call_id);
                    finished_calls.push(ToolCall {
                        call_id,
                        name,
                        arguments,
                    });
                }
                Ok(StreamEvent::UsageUpdate { usage, estimated }) => {
                    emit(events, TurnEvent::Usage { usage, estimated }).await;
                }
                Ok(StreamEvent::Done {
                    usage,
                    stop_reason: reason,
                }) => {
                    call_usage = usage;
                    stop_reason = reason;
                }
                Err(Error::Cancelled) => {
                    was_cancelled = true;
                    break;
                }
                Err(e) => return fail(shared, events, e).await,
            }

            if cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }
        }
        // Dropping the stream aborts the producer.
        drop(stream);

        if was_cancelled {
            // No consolidated events from the aborted stream: the log
            // records the cancellation instead.
            return cancelled_exit(
                shared,
                events,
                &text_buf,
                format!(
                    "Turn cancelled by user mid-stream; partial response discarded: {}",
                    truncate_str(&text_buf, 200)
                ),
            )
            .await;
        }

        // Calls the backend never closed: parse what accumulated, once.
        for (call_id, name, args) in open_calls.drain(..) {
            let arguments = if args.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                match serde_json::from_str(&args) {
                    Ok(value) => value,
                    Err(e) => {
                        return fail(
                            shared,
                            events,
                            Error::Protocol(format!(
                                "tool call '{call_id}' ({name}) arguments are not valid JSON: {e}"
                            )),
                        )
                        .await;
                    }
                }
            };
            finished_calls.push(ToolCall {
                call_id,
                name,
                arguments,
            });
        }

        if let Some(usage) = &call_usage {
            metrics.record_usage(usage);
            emit(
                events,
                TurnEvent::Usage {
                    usage: usage.clone(),
                    estimated: false,
                },
            )
            .await;
        }

        // ── Consolidated events ───────────────────────────────────
        if !thinking_buf.is_empty() {
            shared.store.append(ThreadEvent::new(
                thread_id.clone(),
                EventPayload::Thinking {
                    text: thinking_buf.clone(),
                },
            ))?;
        }
        shared.store.append(ThreadEvent::new(
            thread_id.clone(),
            EventPayload::AgentMessage {
                text: text_buf.clone(),
                usage: call_usage.clone(),
            },
        ))?;
        for call in &finished_calls {
            shared.store.append(ThreadEvent::new(
                thread_id.clone(),
                EventPayload::ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            ))?;
            emit(
                events,
                TurnEvent::ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            )
            .await;
        }

        // ── Terminal? ─────────────────────────────────────────────
        if finished_calls.is_empty() {
            metrics.finish();
            emit(
                events,
                TurnEvent::Final {
                    text: text_buf.clone(),
                },
            )
            .await;
            tracing::debug!(
                thread = %thread_id,
                elapsed_ms = metrics.elapsed_ms(),
                total_tokens = metrics.usage.total_tokens,
                "turn finished"
            );
            return Ok(TurnOutcome {
                text: text_buf,
                stop_reason: if stop_reason.is_terminal() {
                    stop_reason
                } else {
                    StopReason::Stop
                },
                usage: metrics.usage.clone(),
                metrics,
            });
        }

        // ── Tool dispatch ─────────────────────────────────────────
        state.set(AgentState::ToolExecuting);
        if shared.config.parallel_tools {
            run_tools_parallel(shared, events, &finished_calls, cancel).await?;
            if cancel.is_cancelled() {
                return cancelled_exit(
                    shared,
                    events,
                    &text_buf,
                    "Turn cancelled by user during tool execution.".into(),
                )
                .await;
            }
        } else {
            for (idx, call) in finished_calls.iter().enumerate() {
                if cancel.is_cancelled() {
                    let skipped: Vec<&str> = finished_calls[idx..]
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect();
                    return cancelled_exit(
                        shared,
                        events,
                        &text_buf,
                        format!(
                            "Turn cancelled by user; tool call(s) not executed: {}",
                            skipped.join(", ")
                        ),
                    )
                    .await;
                }
                run_one_tool(shared, events, call, cancel).await?;
            }
        }
    }

    // Loop cap reached.
    let message = format!(
        "Tool loop limit reached ({} iterations); turn aborted.",
        shared.config.max_tool_loops
    );
    append_note(shared, message.clone());
    emit(events, TurnEvent::Error { message: message.clone() }).await;
    Err(Error::Other(message))
}

/// Execute one call and append its result with the originating call id.
async fn run_one_tool(
    shared: &AgentShared,
    events: Option<&mpsc::Sender<TurnEvent>>,
    call: &ToolCall,
    cancel: &CancelToken,
) -> Result<()> {
    let result = shared
        .executor
        .execute(&shared.thread_id, call, shared.gate.as_ref(), cancel)
        .await;
    shared.store.append(ThreadEvent::new(
        shared.thread_id.clone(),
        EventPayload::ToolResult {
            call_id: call.call_id.clone(),
            content: result.content.clone(),
            is_error: result.is_error,
        },
    ))?;
    emit(
        events,
        TurnEvent::ToolResult {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            content: result.joined_text(),
            is_error: result.is_error,
        },
    )
    .await;
    Ok(())
}

/// Dispatch all calls concurrently; results are appended in completion
/// order, keyed back to the originating call id.
async fn run_tools_parallel(
    shared: &AgentShared,
    events: Option<&mpsc::Sender<TurnEvent>>,
    calls: &[ToolCall],
    cancel: &CancelToken,
) -> Result<()> {
    use futures_util::stream::FuturesUnordered;

    let mut running: FuturesUnordered<_> = calls
        .iter()
        .map(|call| {
            let executor = shared.executor.clone();
            let gate = shared.gate.clone();
            let thread_id = shared.thread_id.clone();
            let cancel = cancel.clone();
            let call = call.clone();
            async move {
                let result = executor
                    .execute(&thread_id, &call, gate.as_ref(), &cancel)
                    .await;
                (call, result)
            }
        })
        .collect();

    while let Some((call, result)) = running.next().await {
        shared.store.append(ThreadEvent::new(
            shared.thread_id.clone(),
            EventPayload::ToolResult {
                call_id: call.call_id.clone(),
                content: result.content.clone(),
                is_error: result.is_error,
            },
        ))?;
        emit(
            events,
            TurnEvent::ToolResult {
                call_id: call.call_id,
                name: call.name,
                content: result.joined_text(),
                is_error: result.is_error,
            },
        )
        .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("short", 10), "short");
        let truncated = truncate_str("héllo wörld", 6);
        assert!(truncated.chars().count() <= 7);
        // Must not panic on multi-byte boundaries.
        truncate_str("ééééé", 3);
    }

    #[test]
    fn default_config_is_sequential() {
        let config = TurnConfig::default();
        assert!(!config.parallel_tools);
        assert_eq!(config.max_tool_loops, DEFAULT_MAX_TOOL_LOOPS);
        assert!(config.compaction.enabled);
    }
}
