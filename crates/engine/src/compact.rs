//! Context compaction.
//!
//! When the reconstructed prompt approaches the model's budget, the
//! engine summarizes the older part of the conversation into a shadow
//! thread and appends a `Compaction` marker. Effective reads then splice
//! the shadow's events in as a prefix, so the prompt becomes
//! `[summary, recent events…]` — the same shape no matter how many times
//! compaction has run.

use weft_domain::{
    CancelToken, Error, EventPayload, Message, Result, ThreadEvent,
};
use weft_providers::estimate::{estimate_prompt_tokens, estimate_tokens};
use weft_providers::CompletionRequest;

use crate::agent::AgentShared;

const SUMMARIZATION_PROMPT: &str = "You are a conversation summarizer. Summarize the following \
conversation history into a concise summary that preserves:\n\
1. The current goal or plan being worked on\n\
2. Key decisions made\n\
3. Open questions or threads\n\
4. Important facts learned about the user or context\n\
5. Tool state (running processes, active sessions, pending work)\n\n\
Be concise but preserve all actionable context. Write in present tense.\n\
Omit greetings and pleasantries. Focus on substance.";

/// Whether the next model call would exceed the prompt budget.
pub(crate) fn over_budget(shared: &AgentShared, messages: &[Message]) -> bool {
    if !shared.config.compaction.enabled {
        return false;
    }
    let context_window = shared.provider.context_window(&shared.model);
    let max_output = shared.provider.max_completion_tokens(&shared.model);
    let budget =
        context_window.saturating_sub(max_output) as f32 * shared.config.compaction.high_water_ratio;

    let mut estimate = estimate_prompt_tokens(messages);
    if let Some(system) = &shared.config.system_prompt {
        estimate += estimate_tokens(system);
    }
    estimate as f32 > budget
}

/// Index splitting the log into (to_compact, to_keep): the kept suffix
/// starts at the Nth-from-last user message. 0 means nothing to compact.
fn split_point(events: &[ThreadEvent], keep_recent_turns: usize) -> usize {
    let mut user_seen = 0;
    for (idx, event) in events.iter().enumerate().rev() {
        if matches!(event.payload, EventPayload::UserMessage { .. }) {
            user_seen += 1;
            if user_seen >= keep_recent_turns.max(1) {
                return idx;
            }
        }
    }
    0
}

/// Flatten events into role-labelled text for the summarization prompt.
/// Long entries (tool results) are trimmed to keep the prompt manageable.
fn pack_events(events: &[ThreadEvent]) -> String {
    let mut buf = String::new();
    for event in events {
        let (label, text): (&str, String) = match &event.payload {
            EventPayload::UserMessage { text } => ("User", text.clone()),
            EventPayload::AgentMessage { text, .. } => ("Assistant", text.clone()),
            EventPayload::Thinking { .. } => continue,
            EventPayload::ToolCall { name, arguments, .. } => {
                ("Assistant", format!("[called tool {name} with {arguments}]"))
            }
            EventPayload::ToolResult { content, is_error, .. } => {
                let text = content
                    .iter()
                    .map(|b| b.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                (
                    if *is_error { "Tool (error)" } else { "Tool" },
                    text,
                )
            }
            EventPayload::LocalSystemMessage { text } | EventPayload::SystemPrompt { text } => {
                ("System", text.clone())
            }
            EventPayload::Compaction { .. } => continue,
        };
        buf.push_str(label);
        buf.push_str(": ");
        if text.len() > 2000 {
            let head_end = floor_char_boundary(&text, 1000);
            let tail_start = ceil_char_boundary(&text, text.len() - 500);
            buf.push_str(&text[..head_end]);
            buf.push_str(" [...] ");
            buf.push_str(&text[tail_start..]);
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Summarize the older part of the thread into a fresh shadow thread and
/// append the `Compaction` marker. Returns `false` when there was
/// nothing to compact.
pub(crate) async fn run_compaction(shared: &AgentShared, cancel: &CancelToken) -> Result<bool> {
    let events = shared.threads.effective_events(&shared.thread_id)?;
    let cut = split_point(&events, shared.config.compaction.keep_recent_turns);
    if cut == 0 {
        return Ok(false);
    }
    let (to_compact, to_keep) = events.split_at(cut);

    let conversation = pack_events(to_compact);
    let request = CompletionRequest {
        messages: vec![Message::user(format!(
            "{SUMMARIZATION_PROMPT}\n\nCONVERSATION:\n{conversation}"
        ))],
        system: None,
        tools: Vec::new(),
        model: Some(shared.model.clone()),
        max_tokens: Some(shared.config.compaction.summary_max_tokens),
        temperature: Some(0.1),
    };

    let response = shared
        .provider
        .complete(&request, cancel)
        .await
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::CompactionFailed(other.to_string()),
        })?;

    let shadow = shared.threads.create_shadow(&shared.thread_id)?;
    // The summarization exchange is recorded on the shadow for audit:
    // the prompt, the packed conversation it covered, then the summary.
    // Replay skips the first two, so only the summary reaches the model.
    shared.store.append(ThreadEvent::new(
        shadow.clone(),
        EventPayload::SystemPrompt {
            text: SUMMARIZATION_PROMPT.into(),
        },
    ))?;
    shared.store.append(ThreadEvent::new(
        shadow.clone(),
        EventPayload::LocalSystemMessage { text: conversation },
    ))?;
    shared.store.append(ThreadEvent::new(
        shadow.clone(),
        EventPayload::AgentMessage {
            text: response.content.clone(),
            usage: response.usage.clone(),
        },
    ))?;
    // The kept tail is re-homed onto the shadow (ids and payloads
    // preserved) so the splice covers everything before the marker.
    for event in to_keep {
        shared.store.append(ThreadEvent {
            id: event.id.clone(),
            thread_id: shadow.clone(),
            timestamp: event.timestamp,
            payload: event.payload.clone(),
        })?;
    }
    shared.store.append(ThreadEvent::new(
        shared.thread_id.clone(),
        EventPayload::Compaction {
            shadow_thread_id: shadow.clone(),
        },
    ))?;

    tracing::info!(
        thread = %shared.thread_id,
        shadow = %shadow,
        events_compacted = to_compact.len(),
        events_kept = to_keep.len(),
        summary_len = response.content.len(),
        "thread compacted"
    );
    Ok(true)
}
