//! Ollama-native adapter.
//!
//! Talks to the Ollama Chat API (`/api/chat`). Unlike the SSE backends,
//! Ollama emits newline-delimited JSON: one object per line, with the
//! final object carrying `done: true` plus eval counts. Tool calls arrive
//! complete (never as argument fragments) and carry no ids, so the
//! adapter synthesizes stable call ids.
//!
//! `/api/tags` lists locally pulled models and backs the registry's
//! diagnostics ("model X is not pulled").

use serde_json::Value;

use weft_domain::{
    BoxStream, CancelToken, ContentPart, Error, Message, MessageContent, Result, Role, StopReason,
    StreamEvent, ToolCall, ToolDefinition, Usage,
};

use crate::estimate::{estimate_prompt_tokens, UsageEstimator};
use crate::retry::{stream_with_retry, with_retry};
use crate::sse::from_reqwest;
use crate::traits::{AdapterSettings, CompletionRequest, Performance, Provider, ProviderResponse};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider adapter for a local or remote Ollama runner.
#[derive(Debug)]
pub struct OllamaProvider {
    settings: AdapterSettings,
    client: reqwest::Client,
}

impl OllamaProvider {
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

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.settings.base_url.trim_end_matches('/'))
    }

    /// List the models pulled on the runner, for diagnostics.
    pub async fn list_local_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.settings.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(from_reqwest)?;
        let body: Value = resp.json().await.map_err(from_reqwest)?;
        Ok(body
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default())
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
                Role::Assistant => api_messages.push(assistant_msg_to_ollama(msg)),
                Role::Tool => api_messages.extend(tool_results_to_ollama(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_ollama).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(max_tokens) = req.max_tokens {
            body["options"] = serde_json::json!({"num_predict": max_tokens});
        }
        if let Some(temp) = req.temperature {
            body["options"]["temperature"] = serde_json::json!(temp);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn assistant_msg_to_ollama(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": "assistant",
            "content": t,
        }),
        MessageContent::Parts(parts) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { name, input, .. } => {
                        tool_calls.push(serde_json::json!({
                            "function": {"name": name, "arguments": input},
                        }));
                    }
                    _ => {}
                }
            }
            let mut obj = serde_json::json!({
                "role": "assistant",
                "content": text_parts.join("\n"),
            });
            if !tool_calls.is_empty() {
                obj["tool_calls"] = Value::Array(tool_calls);
            }
            obj
        }
    }
}

fn tool_results_to_ollama(msg: &Message) -> Vec<Value> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult { content, .. } => Some(serde_json::json!({
                    "role": "tool",
                    "content": content,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({"role": "tool", "content": t})],
    }
}

fn tool_to_ollama(tool: &ToolDefinition) -> Value {
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

fn normalize_done_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::Stop,
        "length" => StopReason::MaxTokens,
        _ => StopReason::Stop,
    }
}

fn synthesize_call_id() -> String {
    format!("ollama-{}", uuid::Uuid::new_v4().simple())
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let func = tc.get("function")?;
                    Some(ToolCall {
                        call_id: synthesize_call_id(),
                        name: func.get("name")?.as_str()?.to_string(),
                        arguments: func
                            .get("arguments")
                            .cloned()
                            .unwrap_or(Value::Object(Default::default())),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("prompt_eval_count")?.as_u64()? as u32;
    let completion = v.get("eval_count").and_then(|c| c.as_u64()).unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

fn parse_response(body: &Value) -> Result<ProviderResponse> {
    let message = body
        .get("message")
        .ok_or_else(|| Error::Protocol("no message in response".into()))?;
    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let tool_calls = parse_tool_calls(message);

    let stop_reason = if tool_calls.is_empty() {
        body.get("done_reason")
            .and_then(|v| v.as_str())
            .map(normalize_done_reason)
            .unwrap_or(StopReason::Stop)
    } else {
        StopReason::ToolUse
    };

    Ok(ProviderResponse {
        content,
        thinking: String::new(),
        tool_calls,
        stop_reason,
        usage: parse_usage(body),
        performance: None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NDJSON streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StreamState {
    estimator: UsageEstimator,
    saw_tool_calls: bool,
}

/// Parse one NDJSON line into zero or more stream events.
fn parse_ndjson_line(line: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Protocol(format!("bad NDJSON line: {e}")))],
    };

    if let Some(error) = v.get("error").and_then(|e| e.as_str()) {
        return vec![Err(Error::Protocol(error.to_string()))];
    }

    if let Some(message) = v.get("message") {
        if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
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
        for call in parse_tool_calls(message) {
            state.saw_tool_calls = true;
            // Arguments arrive complete, so started/finished are adjacent.
            events.push(Ok(StreamEvent::ToolCallStarted {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
            }));
            events.push(Ok(StreamEvent::ToolCallFinished {
                call_id: call.call_id,
                name: call.name,
                arguments: call.arguments,
            }));
        }
    }

    if v.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        let stop_reason = if state.saw_tool_calls {
            StopReason::ToolUse
        } else {
            v.get("done_reason")
                .and_then(|r| r.as_str())
                .map(normalize_done_reason)
                .unwrap_or(StopReason::Stop)
        };
        events.push(Ok(StreamEvent::Done {
            usage: parse_usage(&v),
            stop_reason,
        }));
    }

    events
}

/// Consume an NDJSON response body, buffering partial lines across
/// chunks.
fn ndjson_response_stream(
    response: reqwest::Response,
    cancel: CancelToken,
    estimated_prompt: u32,
) -> BoxStream<'static, Result<StreamEvent>> {
    Box::pin(async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut state = StreamState {
            estimator: UsageEstimator::new(estimated_prompt),
            saw_tool_calls: false,
        };
        let mut done_emitted = false;

        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk,
                _ = cancel.cancelled() => {
                    yield Err(Error::Cancelled);
                    return;
                }
            };

            match chunk {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        for event in parse_ndjson_line(line, &mut state) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    let trailing = buffer.trim().to_string();
                    if !trailing.is_empty() {
                        for event in parse_ndjson_line(&trailing, &mut state) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                stop_reason: StopReason::Stop,
            });
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
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
        let url = self.chat_url();
        let body = self.build_body(req, false);
        let instance = self.settings.instance_id.clone();

        tracing::debug!(instance = %instance, url = %url, "ollama completion request");

        let started = std::time::Instant::now();
        let mut response = with_retry(&self.settings.retry, cancel, || {
            let request = self.client.post(&url).json(&body);
            let instance = instance.clone();
            async move {
                let resp = tokio::select! {
                    resp = request.send() => resp.map_err(from_reqwest)?,
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                };
                let status = resp.status();
                let text = resp.text().await.map_err(from_reqwest)?;
                if !status.is_success() {
                    return Err(crate::sse::classify_status(status, &instance, &text));
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
        let url = self.chat_url();
        let body = self.build_body(req, true);
        let instance = self.settings.instance_id.clone();
        let client = self.client.clone();
        let estimated_prompt = estimate_prompt_tokens(&req.messages);
        let cancel = cancel.clone();

        tracing::debug!(instance = %instance, url = %url, "ollama stream request");

        let connect_cancel = cancel.clone();
        Ok(stream_with_retry(
            self.settings.retry.clone(),
            cancel,
            move || {
                let client = client.clone();
                let url = url.clone();
                let body = body.clone();
                let instance = instance.clone();
                let cancel = connect_cancel.clone();
                async move {
                    let resp = tokio::select! {
                        resp = client.post(&url).json(&body).send() => resp.map_err(from_reqwest)?,
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    };
                    let status = resp.status();
                    if !status.is_success() {
                        let text = resp.text().await.map_err(from_reqwest)?;
                        return Err(crate::sse::classify_status(status, &instance, &text));
                    }
                    Ok(ndjson_response_stream(resp, cancel.clone(), estimated_prompt))
                }
            },
        ))
    }
}
