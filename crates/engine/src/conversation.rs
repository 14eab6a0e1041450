//! Conversation reconstruction.
//!
//! Turns a thread's effective event list back into provider-shaped
//! messages. The rules:
//!
//! - `Thinking`, `SystemPrompt`, `LocalSystemMessage`, and `Compaction`
//!   events are recorded context, never replayed to the model.
//! - Embedded `<think>…</think>` segments inside agent messages are
//!   stripped before replay.
//! - Tool calls attach to the agent message that issued them; results
//!   become tool-role messages keyed by `call_id`.
//! - A `ToolResult` without a matching prior `ToolCall` is an orphan and
//!   surfaces as a system message, never silently dropped.

use std::collections::HashSet;

use weft_domain::{EventPayload, Message, ThreadEvent, ToolCall};

/// Strip `<think>…</think>` segments. An unterminated `<think>` drops the
/// rest of the text.
pub fn strip_think_segments(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        result.push_str(&rest[..start]);
        match rest[start + OPEN.len()..].find(CLOSE) {
            Some(end) => {
                rest = &rest[start + OPEN.len() + end + CLOSE.len()..];
            }
            None => {
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    result
}

/// Rebuild provider-shaped messages from a thread's effective events.
pub fn build_messages(events: &[ThreadEvent]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    // Agent message text waiting for the tool calls that follow it.
    let mut pending: Option<(String, Vec<ToolCall>)> = None;
    let mut seen_call_ids: HashSet<&str> = HashSet::new();

    fn flush(messages: &mut Vec<Message>, pending: &mut Option<(String, Vec<ToolCall>)>) {
        if let Some((text, calls)) = pending.take() {
            if !calls.is_empty() {
                messages.push(Message::assistant_with_tool_calls(&text, &calls));
            } else if !text.is_empty() {
                messages.push(Message::assistant(text));
            }
        }
    }

    for event in events {
        match &event.payload {
            EventPayload::UserMessage { text } => {
                flush(&mut messages, &mut pending);
                messages.push(Message::user(text.clone()));
            }
            EventPayload::AgentMessage { text, .. } => {
                flush(&mut messages, &mut pending);
                pending = Some((strip_think_segments(text), Vec::new()));
            }
            EventPayload::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                seen_call_ids.insert(call_id.as_str());
                let call = ToolCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                };
                match &mut pending {
                    Some((_, calls)) => calls.push(call),
                    None => pending = Some((String::new(), vec![call])),
                }
            }
            EventPayload::ToolResult {
                call_id,
                content,
                is_error,
            } => {
                flush(&mut messages, &mut pending);
                let text = content
                    .iter()
                    .map(|b| b.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                if seen_call_ids.contains(call_id.as_str()) {
                    messages.push(Message::tool_result(call_id.clone(), text, *is_error));
                } else {
                    messages.push(Message::system(format!("Tool result (orphaned): {text}")));
                }
            }
            // Recorded but never replayed.
            EventPayload::Thinking { .. }
            | EventPayload::SystemPrompt { .. }
            | EventPayload::LocalSystemMessage { .. }
            | EventPayload::Compaction { .. } => {}
        }
    }
    flush(&mut messages, &mut pending);
    messages
}
