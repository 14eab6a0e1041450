//! Per-turn metrics.
//!
//! Process-local and ephemeral: nothing here is persisted in the event
//! log. Final usage counts travel on the `AgentMessage` event instead.

use chrono::{DateTime, Utc};

use weft_domain::Usage;

/// Cumulative metrics for one active turn.
#[derive(Debug, Clone)]
pub struct TurnMetrics {
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    pub first_token_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Model calls made during the turn (1 + one per tool round).
    pub model_calls: u32,
}

impl TurnMetrics {
    pub fn start() -> Self {
        Self {
            usage: Usage::new(0, 0),
            started_at: Utc::now(),
            first_token_at: None,
            finished_at: None,
            model_calls: 0,
        }
    }

    pub fn record_model_call(&mut self) {
        self.model_calls += 1;
    }

    pub fn record_first_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Utc::now());
        }
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Milliseconds from turn start to the first streamed token.
    pub fn time_to_first_token_ms(&self) -> Option<u64> {
        self.first_token_at
            .map(|t| (t - self.started_at).num_milliseconds().max(0) as u64)
    }

    /// Completion tokens per second over the whole turn.
    pub fn tokens_per_second(&self) -> f64 {
        let elapsed = self.elapsed_ms();
        if elapsed == 0 {
            return 0.0;
        }
        self.usage.completion_tokens as f64 * 1000.0 / elapsed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_usage_across_calls() {
        let mut metrics = TurnMetrics::start();
        metrics.record_model_call();
        metrics.record_usage(&Usage::new(10, 5));
        metrics.record_model_call();
        metrics.record_usage(&Usage::new(20, 7));
        assert_eq!(metrics.model_calls, 2);
        assert_eq!(metrics.usage.prompt_tokens, 30);
        assert_eq!(metrics.usage.completion_tokens, 12);
    }

    #[test]
    fn first_token_recorded_once() {
        let mut metrics = TurnMetrics::start();
        metrics.record_first_token();
        let first = metrics.first_token_at;
        metrics.record_first_token();
        assert_eq!(metrics.first_token_at, first);
        assert!(metrics.time_to_first_token_ms().is_some());
    }

    #[test]
    fn zero_elapsed_rate_is_zero() {
        let mut metrics = TurnMetrics::start();
        metrics.finished_at = Some(metrics.started_at);
        assert_eq!(metrics.tokens_per_second(), 0.0);
    }
}
