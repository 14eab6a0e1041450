//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, vLLM, LM Studio, Together, and any other endpoint
//! that follows the chat completions contract, including the streamed
//! tool-call delta format where arguments arrive as string fragments
//! keyed by a stable index.

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider adapter for any OpenAI-compatible API endpoint.
#[derive(Debug)]
pub struct OpenAiProvider {
    settings: AdapterSettings,
    client: reqwest::Client,
}

impl OpenAiProvider {
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

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> Value {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone());

        let mut api_messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            api_messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for msg in &req.messages {
            match msg.role {
                Role::System => api_messages.push(serde_json::json!({
                    "role": "system",
                    "content": msg.content.extract_all_text(),
                })),
                Role::User => api_messages.push(serde_json::json!({
                    "role": "user",
                    "content": msg.content.extract_all_text(),
                })),
                Role::Assistant => api_messages.push(assistant_msg_to_openai(msg)),
                Role::Tool => api_messages.extend(tool_results_to_openai(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
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

fn assistant_msg_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    match &msg.content {
        MessageContent::Text(t) => {
            obj["content"] = Value::String(t.clone());
        }
        MessageContent::Parts(parts) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
            obj["content"] = if text_parts.is_empty() {
                Value::Null
            } else {
                Value::String(text_parts.join("\n"))
            };
            if !tool_calls.is_empty() {
                obj["tool_calls"] = Value::Array(tool_calls);
            }
        }
    }
    obj
}

fn tool_results_to_openai(msg: &Message) -> Vec<Value> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => Some(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({
            "role": "tool",
            "tool_call_id": "",
            "content": t,
        })],
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn normalize_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::Stop,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::Filtered,
        _ => StopReason::Stop,
    }
}

fn parse_response(body: &Value) -> Result<ProviderResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Protocol("no choices in response".into()))?;

    let message = choice
        .get("message")
        .ok_or_else(|| Error::Protocol("no message in choice".into()))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let thinking = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(arr) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in arr {
            let call_id = tc
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let func = tc.get("function").cloned().unwrap_or(Value::Null);
            let name = func
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let args_str = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
            let arguments: Value = serde_json::from_str(args_str).map_err(|e| {
                Error::Protocol(format!(
                    "tool call '{call_id}' ({name}) arguments are not valid JSON: {e}"
                ))
            })?;
            tool_calls.push(ToolCall {
                call_id,
                name,
                arguments,
            });
        }
    }

    let stop_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(normalize_finish_reason)
        .unwrap_or(StopReason::Stop);

    Ok(ProviderResponse {
        content,
        thinking,
        tool_calls,
        stop_reason,
        usage: body.get("usage").and_then(parse_usage),
        performance: None,
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// State for assembling streamed tool calls keyed by choice index.
struct StreamState {
    /// index -> (call_id, name, args buffer).
    tool_calls: HashMap<u64, (String, String, String)>,
    /// Assembly order, so finished calls are emitted as the model issued
    /// them.
    order: Vec<u64>,
    estimator: UsageEstimator,
    usage: Option<Usage>,
    finish_reason: Option<StopReason>,
    done_emitted: bool,
}

impl StreamState {
    fn new(estimated_prompt: u32) -> Self {
        Self {
            tool_calls: HashMap::new(),
            order: Vec::new(),
            estimator: UsageEstimator::new(estimated_prompt),
            usage: None,
            finish_reason: None,
            done_emitted: false,
        }
    }

    /// Flush assembled tool calls in emission order, parsing each
    /// argument buffer exactly once.
    fn flush_tool_calls(&mut self) -> Vec<Result<StreamEvent>> {
        let mut events = Vec::new();
        for idx in std::mem::take(&mut self.order) {
            let Some((call_id, name, args)) = self.tool_calls.remove(&idx) else {
                continue;
            };
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
        events
    }

    fn finish(&mut self) -> Vec<Result<StreamEvent>> {
        let mut events = self.flush_tool_calls();
        if !self.done_emitted {
            self.done_emitted = true;
            events.push(Ok(StreamEvent::Done {
                usage: self.usage.clone(),
                stop_reason: self.finish_reason.unwrap_or(StopReason::Stop),
            }));
        }
        events
    }
}

/// Parse one OpenAI SSE data payload into zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return state.finish();
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Protocol(format!("bad SSE payload: {e}")))],
    };

    let mut events = Vec::new();

    // Usage-only chunk (stream_options.include_usage) has no choices.
    if let Some(usage) = v.get("usage").and_then(parse_usage) {
        state.usage = Some(usage.clone());
        events.push(Ok(StreamEvent::UsageUpdate {
            usage,
            estimated: false,
        }));
    }

    let Some(choice) = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    else {
        return events;
    };

    if let Some(delta) = choice.get("delta") {
        // Tool call deltas keyed by a stable index.
        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    state
                        .tool_calls
                        .insert(idx, (id.to_string(), name.clone(), String::new()));
                    state.order.push(idx);
                    events.push(Ok(StreamEvent::ToolCallStarted {
                        call_id: id.to_string(),
                        name,
                    }));
                }
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    if let Some((call_id, _, buffer)) = state.tool_calls.get_mut(&idx) {
                        buffer.push_str(args);
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id: call_id.clone(),
                            delta: args.to_string(),
                        }));
                    }
                }
            }
        }

        // Reasoning content (DeepSeek and friends).
        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Thinking {
                    text: text.to_string(),
                }));
            }
        }

        // Text content delta.
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
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

    // Finish reason arrives on the last content chunk; the final usage
    // chunk may still follow, so Done waits for [DONE] or stream end.
    if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        state.finish_reason = Some(normalize_finish_reason(reason));
        events.extend(state.flush_tool_calls());
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
        let url = self.completions_url();
        let body = self.build_body(req, false);
        let instance = self.settings.instance_id.clone();

        tracing::debug!(instance = %instance, url = %url, "openai completion request");

        let started = std::time::Instant::now();
        let mut response = with_retry(&self.settings.retry, cancel, || {
            let request = self
                .client
                .post(&url)
                .bearer_auth(&self.settings.api_key)
                .json(&body);
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
        let url = self.completions_url();
        let body = self.build_body(req, true);
        let instance = self.settings.instance_id.clone();
        let client = self.client.clone();
        let api_key = self.settings.api_key.clone();
        let estimated_prompt = estimate_prompt_tokens(&req.messages);
        let cancel = cancel.clone();

        tracing::debug!(instance = %instance, url = %url, "openai stream request");

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
                        resp = client.post(&url).bearer_auth(&api_key).json(&body).send() =>
                            resp.map_err(from_reqwest)?,
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
