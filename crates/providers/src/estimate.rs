//! Progressive token estimation for backends that omit streaming usage.
//!
//! Output tokens are approximated from character length with a small
//! divisor, emitted as provisional `UsageUpdate`s so the UI can show
//! progress. Updates are rate-limited by estimated-token delta so a busy
//! stream does not flood subscribers. Authoritative counts, when the
//! backend finally reports them, supersede every estimate.

use weft_domain::{Message, Usage};

/// Characters per token. A rough universal average for English-heavy
/// model output.
pub const CHARS_PER_TOKEN: u32 = 4;

/// Minimum estimated-token advance between emitted updates.
const EMIT_GRANULARITY: u32 = 16;

/// Estimate the token count of a text by character length.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(CHARS_PER_TOKEN)
}

/// Estimate the prompt size of a request's messages, with a small
/// per-message overhead for role framing.
pub fn estimate_prompt_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content.extract_all_text()) + 4)
        .sum()
}

/// Tracks streamed output characters and decides when a provisional
/// usage update is due.
pub struct UsageEstimator {
    prompt_tokens: u32,
    chars_seen: usize,
    last_emitted: u32,
}

impl UsageEstimator {
    pub fn new(prompt_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            chars_seen: 0,
            last_emitted: 0,
        }
    }

    /// Record a streamed text chunk. Returns a provisional [`Usage`] when
    /// enough new output has accumulated since the last update.
    pub fn record(&mut self, text: &str) -> Option<Usage> {
        self.chars_seen += text.len();
        let estimated = (self.chars_seen as u32).div_ceil(CHARS_PER_TOKEN);
        if estimated >= self.last_emitted + EMIT_GRANULARITY {
            self.last_emitted = estimated;
            Some(Usage::new(self.prompt_tokens, estimated))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn prompt_estimate_counts_all_messages() {
        let messages = vec![Message::user("hello world!"), Message::assistant("hi")];
        // 12 chars -> 3 tokens + 4 overhead; 2 chars -> 1 token + 4 overhead.
        assert_eq!(estimate_prompt_tokens(&messages), 12);
    }

    #[test]
    fn estimator_rate_limits_updates() {
        let mut estimator = UsageEstimator::new(100);
        // 10 chars = ~3 tokens: below granularity, no update.
        assert!(estimator.record("0123456789").is_none());
        // Push past 16 estimated tokens.
        let update = estimator.record(&"x".repeat(60)).unwrap();
        assert_eq!(update.prompt_tokens, 100);
        assert!(update.completion_tokens >= 16);
        // Immediately after an emit, small additions stay quiet.
        assert!(estimator.record("y").is_none());
    }
}
