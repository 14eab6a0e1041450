//! Server-sent-event decoding for the HTTP adapters.
//!
//! The SSE backends (Anthropic, OpenAI-compatible) stream framed text:
//! field lines terminated by `\n` or `\r\n`, with a blank line closing
//! each event. [`SseDecoder`] consumes raw body bytes incrementally and
//! yields one payload string per event — the event's `data` lines joined
//! with newlines, as the format prescribes. Everything else (`event:`,
//! `id:`, `retry:`, `:` keep-alive comments) carries nothing the
//! adapters need and is discarded.

use std::collections::VecDeque;

use weft_domain::{BoxStream, CancelToken, Error, Result, StopReason, StreamEvent};

/// Incremental SSE frame decoder.
///
/// Feed body chunks with [`push`](Self::push), pull completed event
/// payloads with [`next_payload`](Self::next_payload), and call
/// [`finish`](Self::finish) once the body closes so a response that was
/// cut off without a final blank line still surfaces its last event.
pub(crate) struct SseDecoder {
    /// Bytes not yet scanned into a complete line.
    buffer: String,
    /// `data` lines of the event currently being assembled.
    data_lines: Vec<String>,
    /// Completed payloads awaiting the caller.
    ready: VecDeque<String>,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            data_lines: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Feed raw body bytes and scan any lines they complete.
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.take_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    /// Close the body. A trailing line without its newline, and an event
    /// without its closing blank line, are both completed here.
    pub(crate) fn finish(&mut self) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.take_line(line.trim_end_matches('\r'));
        }
        self.close_event();
    }

    /// The next completed event payload, if any.
    pub(crate) fn next_payload(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn take_line(&mut self, line: &str) {
        if line.is_empty() {
            self.close_event();
        } else if line.starts_with(':') {
            // Keep-alive comment.
        } else if let Some(value) = line.strip_prefix("data:") {
            // One leading space after the colon is framing, not payload.
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_owned());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
        // event/id/retry fields carry nothing the adapters consume.
    }

    fn close_event(&mut self) {
        if self.data_lines.is_empty() {
            return;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        if !payload.trim().is_empty() {
            self.ready.push_back(payload);
        }
    }
}

/// Drive an SSE `reqwest::Response` through the decoder and a
/// backend-specific payload parser, producing the adapter's stream.
///
/// The parser is `FnMut` so adapters can accumulate state across
/// payloads (tool-call assembly, usage tracking). Cancellation races the
/// body read and surfaces as `Error::Cancelled`. A backend that drops
/// the connection without a closing frame still owes the engine a
/// terminal event, so a fallback `Done` is emitted when the parser never
/// produced one.
pub(crate) fn sse_event_stream<F>(
    response: reqwest::Response,
    cancel: CancelToken,
    mut parse_payload: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut response = response;
        let mut decoder = SseDecoder::new();
        let mut saw_done = false;

        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk,
                _ = cancel.cancelled() => {
                    yield Err(Error::Cancelled);
                    return;
                }
            };

            let body_ended = match chunk {
                Ok(Some(bytes)) => {
                    decoder.push(&bytes);
                    false
                }
                Ok(None) => {
                    decoder.finish();
                    true
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    return;
                }
            };

            while let Some(payload) = decoder.next_payload() {
                for event in parse_payload(&payload) {
                    saw_done |= matches!(&event, Ok(StreamEvent::Done { .. }));
                    yield event;
                }
            }

            if body_ended {
                break;
            }
        }

        if !saw_done {
            yield Ok(StreamEvent::Done {
                usage: None,
                stop_reason: StopReason::Stop,
            });
        }
    })
}

/// Convert a [`reqwest::Error`] into the domain error type. Timeouts and
/// connection failures are transient; everything else is a protocol
/// failure.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::Transient(e.to_string())
    } else {
        Error::Protocol(e.to_string())
    }
}

/// Classify an HTTP error status per the retry policy: 5xx and 429 are
/// transient, 401/403 are auth, everything else 4xx is protocol.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    instance: &str,
    body: &str,
) -> Error {
    if status.is_server_error() || status.as_u16() == 429 {
        Error::Transient(format!("HTTP {} - {body}", status.as_u16()))
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        Error::Auth {
            instance: instance.to_owned(),
            message: format!("HTTP {} - {body}", status.as_u16()),
        }
    } else {
        Error::Protocol(format!("HTTP {} - {body}", status.as_u16()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a whole transcript at once and collect every payload.
    fn decode_all(raw: &str) -> Vec<String> {
        let mut decoder = SseDecoder::new();
        decoder.push(raw.as_bytes());
        decoder.finish();
        std::iter::from_fn(|| decoder.next_payload()).collect()
    }

    #[test]
    fn anthropic_style_frames_decode_in_order() {
        let raw = "event: message_start\n\
                   data: {\"type\":\"message_start\"}\n\n\
                   event: content_block_delta\n\
                   data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hi\"}}\n\n";
        assert_eq!(
            decode_all(raw),
            vec![
                r#"{"type":"message_start"}"#,
                r#"{"type":"content_block_delta","delta":{"text":"Hi"}}"#,
            ]
        );
    }

    #[test]
    fn crlf_framing_is_accepted() {
        let raw = "data: {\"a\":1}\r\n\r\ndata: [DONE]\r\n\r\n";
        assert_eq!(decode_all(raw), vec![r#"{"a":1}"#, "[DONE]"]);
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let raw = "data: first half\ndata: second half\n\n";
        assert_eq!(decode_all(raw), vec!["first half\nsecond half"]);
    }

    #[test]
    fn comments_and_non_data_fields_are_discarded() {
        let raw = ": keep-alive\nid: 7\nretry: 3000\nevent: ping\ndata: payload\n\n";
        assert_eq!(decode_all(raw), vec!["payload"]);
    }

    #[test]
    fn blank_line_without_data_yields_nothing() {
        assert!(decode_all("event: ping\n\n\n\n").is_empty());
        assert!(decode_all("data: \n\n").is_empty());
    }

    #[test]
    fn payload_split_across_pushes_stays_buffered() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"type\":\"mess");
        assert!(decoder.next_payload().is_none());

        decoder.push(b"age_stop\"}\n");
        // Line complete, but the event is still open.
        assert!(decoder.next_payload().is_none());

        decoder.push(b"\n");
        assert_eq!(
            decoder.next_payload().unwrap(),
            r#"{"type":"message_stop"}"#
        );
    }

    #[test]
    fn finish_completes_a_truncated_final_event() {
        let mut decoder = SseDecoder::new();
        // Connection cut after the data line, before the blank line.
        decoder.push(b"data: {\"last\":true}");
        assert!(decoder.next_payload().is_none());
        decoder.finish();
        assert_eq!(decoder.next_payload().unwrap(), r#"{"last":true}"#);
    }

    #[test]
    fn only_one_leading_space_is_stripped() {
        assert_eq!(decode_all("data:  two spaces\n\n"), vec![" two spaces"]);
        assert_eq!(decode_all("data:no space\n\n"), vec!["no space"]);
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "i", ""),
            Error::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "i", ""),
            Error::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "i", ""),
            Error::Auth { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "i", ""),
            Error::Protocol(_)
        ));
    }
}
