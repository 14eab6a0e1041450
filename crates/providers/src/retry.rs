//! Retry policy with jittered exponential back-off.
//!
//! Applies to both request paths. Only transient failures are retried;
//! authentication and malformed-request errors surface immediately. For
//! streaming, retry is legal only **before the first stream event has
//! been observed** — once the backend has begun emitting, the response
//! either completes or fails, never restarts.

use std::future::Future;
use std::time::Duration;

use weft_domain::{BoxStream, CancelToken, Error, Result, StreamEvent};

/// Controls back-off between retry attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Total attempts (first try included).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay for the given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // ~25% jitter to spread retry storms.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to avoid thundering herds.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

/// Sleep for the attempt's back-off, racing the cancel token.
async fn backoff_sleep(policy: &RetryPolicy, attempt: u32, cancel: &CancelToken) -> Result<()> {
    let delay = policy.delay_for_attempt(attempt);
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Run `op` with retries for transient failures.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                tracing::warn!(attempt, error = %e, "transient provider failure, retrying");
                backoff_sleep(policy, attempt, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open a stream with retries, refusing any retry once the first event
/// has been observed.
///
/// `connect` is invoked per attempt and returns the backend stream.
/// Connection errors and pre-first-byte stream errors are retried when
/// transient; after the first byte the stream is passed through
/// unchanged.
pub fn stream_with_retry<F, Fut>(
    policy: RetryPolicy,
    cancel: CancelToken,
    mut connect: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Result<StreamEvent>>>> + Send,
{
    use futures_util::StreamExt;

    Box::pin(async_stream::stream! {
        let mut attempt: u32 = 0;
        let mut first_byte_seen = false;

        'attempts: loop {
            if cancel.is_cancelled() {
                yield Err(Error::Cancelled);
                return;
            }

            let mut stream = match connect().await {
                Ok(stream) => stream,
                Err(e) if e.is_retryable()
                    && !first_byte_seen
                    && attempt + 1 < policy.max_attempts =>
                {
                    tracing::warn!(attempt, error = %e, "stream connect failed, retrying");
                    if backoff_sleep(&policy, attempt, &cancel).await.is_err() {
                        yield Err(Error::Cancelled);
                        return;
                    }
                    attempt += 1;
                    continue 'attempts;
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        first_byte_seen = true;
                        yield Ok(event);
                    }
                    Err(e) if e.is_retryable()
                        && !first_byte_seen
                        && attempt + 1 < policy.max_attempts =>
                    {
                        tracing::warn!(attempt, error = %e, "stream failed before first byte, retrying");
                        if backoff_sleep(&policy, attempt, &cancel).await.is_err() {
                            yield Err(Error::Cancelled);
                            return;
                        }
                        attempt += 1;
                        continue 'attempts;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            return;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use weft_domain::StopReason;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            max_attempts: 3,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for_attempt(1) > policy.delay_for_attempt(0));
        // Capped at max_delay + 25% jitter.
        let capped = policy.delay_for_attempt(20);
        assert!(capped <= Duration::from_millis(37_500));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&fast_policy(), &CancelToken::new(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = with_retry(&fast_policy(), &CancelToken::new(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Auth {
                    instance: "main".into(),
                    message: "401".into(),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = with_retry(&fast_policy(), &CancelToken::new(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Transient("down".into()))
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stream_retries_connect_failures() {
        use futures_util::StreamExt;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let stream = stream_with_retry(fast_policy(), CancelToken::new(), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Transient("refused".into()))
                } else {
                    let events: Vec<Result<StreamEvent>> = vec![
                        Ok(StreamEvent::Token { text: "ok".into() }),
                        Ok(StreamEvent::Done {
                            usage: None,
                            stop_reason: StopReason::Stop,
                        }),
                    ];
                    Ok(Box::pin(futures_util::stream::iter(events))
                        as BoxStream<'static, Result<StreamEvent>>)
                }
            }
        });
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_ok()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_retry_after_first_byte() {
        use futures_util::StreamExt;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let stream = stream_with_retry(fast_policy(), CancelToken::new(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // Emits a token, then a transient failure: the failure
                // must surface, not restart the stream.
                let events: Vec<Result<StreamEvent>> = vec![
                    Ok(StreamEvent::Token { text: "t".into() }),
                    Err(Error::Transient("mid-stream drop".into())),
                ];
                Ok(Box::pin(futures_util::stream::iter(events))
                    as BoxStream<'static, Result<StreamEvent>>)
            }
        });
        let events: Vec<_> = stream.collect().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(Error::Transient(_))));
    }

    #[tokio::test]
    async fn pre_first_byte_stream_error_is_retried() {
        use futures_util::StreamExt;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let stream = stream_with_retry(fast_policy(), CancelToken::new(), move || {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                let events: Vec<Result<StreamEvent>> = if attempt == 0 {
                    // Fails before yielding any event.
                    vec![Err(Error::Transient("reset".into()))]
                } else {
                    vec![Ok(StreamEvent::Done {
                        usage: None,
                        stop_reason: StopReason::Stop,
                    })]
                };
                Ok(Box::pin(futures_util::stream::iter(events))
                    as BoxStream<'static, Result<StreamEvent>>)
            }
        });
        let events: Vec<_> = stream.collect().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[tokio::test]
    async fn cancelled_backoff_stops_retrying() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = with_retry(&fast_policy(), &cancel, || async {
            Err::<(), _>(Error::Transient("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
