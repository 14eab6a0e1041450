//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use, streaming,
//! native thinking blocks, and the Anthropic-specific message structure
//! where system prompts go in a separate top-level `system` field.

use std::collections::HashMap;

use serde_json::Value;

use weft_domain::{
    BoxStream, CancelToken, ContentPart, Error, Message, MessageContent, Result, Role, StopReason,
    StreamEvent, ToolCall, ToolDefinition, Usage,
};

use crate::estimate::{estimate_prompt_tokens, UsageEstimator};
use crate::retry::{stream_with_retry, with_retry};
use crate::sse::{classify_status, from_reqwest, sse_event_stream};
use crate::traits::{AdapterSettings, CompletionRequest, Performance, Provider, ProviderResponse};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider adapter for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicProvider {
    settings: AdapterSettings,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(mut settings: AdapterSettings) -> Result<Self> {
        if settings.base_url.is_empty() {
            settings.base_url = DEFAULT_BASE_URL.into();
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(from_reqwest)?;
        Ok(Self { settings, client })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.settings.base_url.trim_end_matches('/'))
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> Value {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone());
        let max_tokens = req
            .max_tokens
            .unwrap_or_else(|| self.max_completion_tokens(&model));

        let mut api_messages: Vec<Value> = Vec::new();
        for msg in &req.messages {
            match msg.role {
                // System content travels in the top-level field.
                Role::System => {}
                Role::User => api_messages.push(user_msg_to_anthropic(msg)),
                Role::Assistant => api_messages.push(assistant_msg_to_anthropic(msg)),
                // Anthropic expects tool results as user messages with
                // tool_result content blocks.
                Role::Tool => api_messages.push(tool_result_to_anthropic(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "max_tokens": max_tokens,
            "stream": stream,
        });

        let mut system_parts: Vec<String> = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.extract_all_text())
            .collect();
        if let Some(system) = &req.system {
            system_parts.insert(0, system.clone());
        }
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn user_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": "user",
            "content": t,
        }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(serde_json::json!({
                        "type": "text",
                        "text": text,
                    })),
                    _ => None,
                })
                .collect();
            serde_json::json!({
                "role": "user",
                "content": content,
            })
        }
    }
}

fn assistant_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": "assistant",
            "content": [{"type": "text", "text": t}],
        }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(serde_json::json!({
                        "type": "text",
                        "text": text,
                    })),
                    ContentPart::ToolUse { id, name, input } => Some(serde_json::json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    })),
                    _ => None,
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": content,
            })
        }
    }
}

fn tool_result_to_anthropic(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({
            "type": "tool_result",
            "tool_use_id": "",
            "content": t,
        })],
    };
    serde_json::json!({
        "role": "user",
        "content": content,
    })
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn normalize_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" | "stop_sequence" => StopReason::Stop,
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::Filtered,
        _ => StopReason::Stop,
    }
}

fn parse_response(body: &Value) -> Result<ProviderResponse> {
    let empty = Vec::new();
    let content_arr = body
        .get("content")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut text_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in content_arr {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t.to_string());
                }
            }
            "thinking" => {
                if let Some(t) = block.get("thinking").and_then(|v| v.as_str()) {
                    thinking_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                tool_calls.push(ToolCall {
                    call_id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    arguments: block
                        .get("input")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                });
            }
            _ => {}
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(normalize_stop_reason)
        .unwrap_or(StopReason::Stop);

    Ok(ProviderResponse {
        content: text_parts.join(""),
        thinking: thinking_parts.join(""),
        tool_calls,
        stop_reason,
        usage: body.get("usage").and_then(parse_usage),
        performance: None,
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage::new(input, output))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// State for assembling tool calls and usage from streaming blocks.
struct StreamState {
    /// Active tool calls keyed by block index: (call_id, name, args buffer).
    active_tool_calls: HashMap<u64, (String, String, String)>,
    /// Block indices that carry thinking deltas.
    thinking_blocks: std::collections::HashSet<u64>,
    /// Prompt tokens from message_start.
    prompt_tokens: u32,
    /// Authoritative output tokens so far.
    output_tokens: Option<u32>,
    estimator: UsageEstimator,
    done_emitted: bool,
}

impl StreamState {
    fn new(estimated_prompt: u32) -> Self {
        Self {
            active_tool_calls: HashMap::new(),
            thinking_blocks: std::collections::HashSet::new(),
            prompt_tokens: estimated_prompt,
            output_tokens: None,
            estimator: UsageEstimator::new(estimated_prompt),
            done_emitted: false,
        }
    }

    fn usage(&self) -> Option<Usage> {
        self.output_tokens
            .map(|out| Usage::new(self.prompt_tokens, out))
    }
}

/// Parse one Anthropic SSE data payload into zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Protocol(format!("bad SSE payload: {e}"))));
            return events;
        }
    };

    match v.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(usage) = v
                .get("message")
                .and_then(|m| m.get("usage"))
                .and_then(parse_usage)
            {
                state.prompt_tokens = usage.prompt_tokens;
                state.estimator = UsageEstimator::new(usage.prompt_tokens);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "tool_use" => {
                        let call_id = block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            name: name.clone(),
                        }));
                        state
                            .active_tool_calls
                            .insert(idx, (call_id, name, String::new()));
                    }
                    "thinking" => {
                        state.thinking_blocks.insert(idx);
                    }
                    _ => {}
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                if let Some(estimate) = state.estimator.record(text) {
                                    events.push(Ok(StreamEvent::UsageUpdate {
                                        usage: estimate,
                                        estimated: true,
                                    }));
                                }
                                events.push(Ok(StreamEvent::Token {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !text.is_empty() && state.thinking_blocks.contains(&idx) {
                                events.push(Ok(StreamEvent::Thinking {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                                tc.2.push_str(partial);
                                events.push(Ok(StreamEvent::ToolCallDelta {
                                    call_id: tc.0.clone(),
                                    delta: partial.to_string(),
                                }));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            state.thinking_blocks.remove(&idx);
            if let Some((call_id, name, args)) = state.active_tool_calls.remove(&idx) {
                // Arguments are parsed exactly once, here, at completion.
                let arguments = if args.trim().is_empty() {
                    Ok(Value::Object(Default::default()))
                } else {
                    serde_json::from_str(&args).map_err(|e| {
                        Error::Protocol(format!(
                            "tool call '{call_id}' ({name}) arguments are not valid JSON: {e}"
                        ))
                    })
                };
                match arguments {
                    Ok(arguments) => events.push(Ok(StreamEvent::ToolCallFinished {
                        call_id,
                        name,
                        arguments,
                    })),
                    Err(e) => events.push(Err(e)),
                }
            }
        }

        "message_delta" => {
            if let Some(output) = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|v| v.as_u64())
            {
                state.output_tokens = Some(output as u32);
                if let Some(usage) = state.usage() {
                    events.push(Ok(StreamEvent::UsageUpdate {
                        usage,
                        estimated: false,
                    }));
                }
            }
            if let Some(reason) = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
            {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: state.usage(),
                    stop_reason: normalize_stop_reason(reason),
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: state.usage(),
                    stop_reason: StopReason::Stop,
                }));
            }
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            let overloaded = v
                .get("error")
                .and_then(|e| e.get("type"))
                .and_then(|v| v.as_str())
                == Some("overloaded_error");
            events.push(Err(if overloaded {
                Error::Transient(message.to_string())
            } else {
                Error::Protocol(message.to_string())
            }));
        }

        // ping or unknown event types.
        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn context_window(&self, model: &str) -> u32 {
        self.settings.limits_for(model).context_window
    }

    fn max_completion_tokens(&self, model: &str) -> u32 {
        self.settings.limits_for(model).max_completion_tokens
    }

    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<ProviderResponse> {
        let url = self.messages_url();
        let body = self.build_body(req, false);
        let instance = self.settings.instance_id.clone();

        tracing::debug!(instance = %instance, url = %url, "anthropic completion request");

        let started = std::time::Instant::now();
        let mut response = with_retry(&self.settings.retry, cancel, || {
            let request = self.authed_post(&url).json(&body);
            let instance = instance.clone();
            async move {
                let resp = tokio::select! {
                    resp = request.send() => resp.map_err(from_reqwest)?,
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                };
                let status = resp.status();
                let text = resp.text().await.map_err(from_reqwest)?;
                if !status.is_success() {
                    return Err(classify_status(status, &instance, &text));
                }
                let json: Value = serde_json::from_str(&text)
                    .map_err(|e| Error::Protocol(format!("bad response body: {e}")))?;
                parse_response(&json)
            }
        })
        .await?;
        response.performance = Some(Performance {
            elapsed_ms: started.elapsed().as_millis() as u64,
            first_token_ms: None,
        });
        Ok(response)
    }

    async fn stream(
        &self,
        req: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = self.messages_url();
        let body = self.build_body(req, true);
        let instance = self.settings.instance_id.clone();
        let client = self.client.clone();
        let api_key = self.settings.api_key.clone();
        let estimated_prompt = estimate_prompt_tokens(&req.messages);
        let cancel = cancel.clone();

        tracing::debug!(instance = %instance, url = %url, "anthropic stream request");

        let connect_cancel = cancel.clone();
        Ok(stream_with_retry(
            self.settings.retry.clone(),
            cancel,
            move || {
                let client = client.clone();
                let url = url.clone();
                let api_key = api_key.clone();
                let body = body.clone();
                let instance = instance.clone();
                let cancel = connect_cancel.clone();
                async move {
                    let resp = tokio::select! {
                        resp = client
                            .post(&url)
                            .header("x-api-key", &api_key)
                            .header("anthropic-version", ANTHROPIC_VERSION)
                            .header("Content-Type", "application/json")
                            .json(&body)
                            .send() => resp.map_err(from_reqwest)?,
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    };
                    let status = resp.status();
                    if !status.is_success() {
                        let text = resp.text().await.map_err(from_reqwest)?;
                        return Err(classify_status(status, &instance, &text));
                    }
                    let mut state = StreamState::new(estimated_prompt);
                    Ok(sse_event_stream(resp, cancel.clone(), move |data| {
                        parse_sse(data, &mut state)
                    }))
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StreamState {
        StreamState::new(50)
    }

    #[test]
    fn normalizes_stop_reasons() {
        assert_eq!(normalize_stop_reason("end_turn"), StopReason::Stop);
        assert_eq!(normalize_stop_reason("max_tokens"), StopReason::MaxTokens);
        assert_eq!(normalize_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(normalize_stop_reason("refusal"), StopReason::Filtered);
        assert_eq!(normalize_stop_reason("stop_sequence"), StopReason::Stop);
    }

    #[test]
    fn parses_text_response() {
        let body = serde_json::json!({
            "content": [{"type": "text", "text": "Hi!"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 3},
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.content, "Hi!");
        assert_eq!(resp.stop_reason, StopReason::Stop);
        assert_eq!(resp.usage.unwrap(), Usage::new(10, 3));
    }

    #[test]
    fn parses_tool_use_response() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": ""},
                {"type": "tool_use", "id": "c1", "name": "bash", "input": {"command": "ls"}},
            ],
            "stop_reason": "tool_use",
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "bash");
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn parses_thinking_blocks() {
        let body = serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "let me see"},
                {"type": "text", "text": "answer"},
            ],
            "stop_reason": "end_turn",
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.thinking, "let me see");
        assert_eq!(resp.content, "answer");
    }

    #[test]
    fn sse_text_deltas_become_tokens() {
        let mut state = state();
        let events = parse_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            &mut state,
        );
        assert!(matches!(
            events.last().unwrap(),
            Ok(StreamEvent::Token { text }) if text == "Hello"
        ));
    }

    #[test]
    fn sse_tool_call_assembly() {
        let mut state = state();
        let started = parse_sse(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"c1","name":"bash"}}"#,
            &mut state,
        );
        assert!(matches!(
            &started[0],
            Ok(StreamEvent::ToolCallStarted { call_id, .. }) if call_id == "c1"
        ));

        parse_sse(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}"#,
            &mut state,
        );
        parse_sse(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"ls\"}"}}"#,
            &mut state,
        );
        let finished = parse_sse(r#"{"type":"content_block_stop","index":1}"#, &mut state);
        match &finished[0] {
            Ok(StreamEvent::ToolCallFinished { arguments, .. }) => {
                assert_eq!(arguments["command"], "ls");
            }
            other => panic!("expected finished call, got {other:?}"),
        }
    }

    #[test]
    fn sse_malformed_arguments_fail_at_block_stop() {
        let mut state = state();
        parse_sse(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"c1","name":"bash"}}"#,
            &mut state,
        );
        parse_sse(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\": "}}"#,
            &mut state,
        );
        let finished = parse_sse(r#"{"type":"content_block_stop","index":1}"#, &mut state);
        assert!(matches!(&finished[0], Err(Error::Protocol(_))));
    }

    #[test]
    fn sse_message_delta_finishes_with_usage() {
        let mut state = state();
        parse_sse(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":0}}}"#,
            &mut state,
        );
        let events = parse_sse(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            &mut state,
        );
        let done = events
            .iter()
            .find_map(|e| match e {
                Ok(StreamEvent::Done { usage, stop_reason }) => Some((usage.clone(), *stop_reason)),
                _ => None,
            })
            .unwrap();
        assert_eq!(done.0.unwrap(), Usage::new(12, 7));
        assert_eq!(done.1, StopReason::Stop);
    }

    #[test]
    fn sse_thinking_deltas() {
        let mut state = state();
        parse_sse(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
            &mut state,
        );
        let events = parse_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            &mut state,
        );
        assert!(matches!(
            &events[0],
            Ok(StreamEvent::Thinking { text }) if text == "hmm"
        ));
    }

    #[test]
    fn sse_overload_error_is_transient() {
        let mut state = state();
        let events = parse_sse(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
            &mut state,
        );
        assert!(matches!(&events[0], Err(Error::Transient(_))));
    }

    #[test]
    fn body_separates_system_and_tools() {
        let provider = AnthropicProvider::new(AdapterSettings::for_tests("anthropic-main")).unwrap();
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            system: Some("be brief".into()),
            tools: vec![ToolDefinition {
                name: "bash".into(),
                description: "run a command".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            ..Default::default()
        };
        let body = provider.build_body(&req, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["tools"][0]["name"], "bash");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
