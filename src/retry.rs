//! Retry policy: backoff/jitter-driven re-attempts gated by error classification.
//!
//! Six rules decide whether a failure is retried (spec-equivalent to the
//! classification in the original Python client's `RetryStrategy`):
//! rate limits and server/network/timeout errors retry, client errors,
//! validation failures, auth failures, cancellation, and an already-open
//! breaker do not.

use crate::backoff::RetryBackoff;
use crate::clock::{RetryWaiter, TokioWaiter};
use crate::error::{ErrorKind, PipelineError, RetryExhausted, MAX_RETRY_FAILURES};
use crate::jitter::RetryJitter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a classification decision for one observed error.
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: RetryBackoff,
    jitter: RetryJitter,
    should_retry: Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>,
    waiter: Arc<dyn RetryWaiter>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Default classification: retry everything `ErrorKind` considers
    /// retryable except a breaker that is already open, since retrying
    /// immediately against an open breaker only burns attempts.
    fn default_should_retry(err: &PipelineError) -> bool {
        !matches!(err.kind, ErrorKind::BreakerOpen { .. }) && err.is_retryable_kind()
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, PipelineError>
    where
        T: Send,
        Fut: Future<Output = Result<T, PipelineError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures: Vec<PipelineError> = Vec::new();

        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !(self.should_retry)(&err) {
                        return Err(err);
                    }

                    let retry_after = match &err.kind {
                        ErrorKind::RateLimit { retry_after } => *retry_after,
                        _ => None,
                    };

                    failures.push(err);
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    if attempt + 1 >= self.max_attempts {
                        return Err(PipelineError::new(
                            ErrorKind::Internal,
                            RetryExhausted { attempts: self.max_attempts, failures }.to_string(),
                        ));
                    }

                    let delay = match retry_after {
                        Some(hint) => hint,
                        None => self.jitter.apply(self.backoff.delay(attempt + 1)),
                    };

                    self.waiter.wait(delay).await;
                }
            }
        }

        unreachable!("retry loop always returns or errors before exhausting max_attempts")
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: RetryBackoff,
    jitter: RetryJitter,
    should_retry: Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>,
    waiter: Arc<dyn RetryWaiter>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => write!(f, "max_attempts must be > 0 (got {n})"),
        }
    }
}

impl std::error::Error for BuildError {}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: RetryBackoff::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(300)),
            jitter: RetryJitter::full(),
            should_retry: Arc::new(RetryPolicy::default_should_retry),
            waiter: Arc::new(TokioWaiter),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Result<Self, BuildError> {
        if attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(attempts));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: RetryJitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_waiter<W>(mut self, waiter: W) -> Self
    where
        W: RetryWaiter + 'static,
    {
        self.waiter = Arc::new(waiter);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            waiter: self.waiter,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{InstantWaiter, RecordingWaiter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn success_first_attempt_does_not_retry() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .backoff(RetryBackoff::constant(Duration::from_millis(100)))
            .with_waiter(InstantWaiter)
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PipelineError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .unwrap()
            .backoff(RetryBackoff::constant(Duration::from_millis(10)))
            .with_waiter(InstantWaiter)
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(PipelineError::server_api(503, "unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .unwrap()
            .with_waiter(InstantWaiter)
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PipelineError::client_api(404, "not found"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_open_is_not_retried() {
        let policy = RetryPolicy::builder().max_attempts(5).unwrap().with_waiter(InstantWaiter).build();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PipelineError::breaker_open(3, Duration::from_secs(1)))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_and_jitter_none_produce_exact_delays() {
        let waiter = RecordingWaiter::new();
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .unwrap()
            .backoff(RetryBackoff::linear(Duration::from_millis(100)))
            .with_jitter(RetryJitter::None)
            .with_waiter(waiter.clone())
            .build();

        let _ = policy.execute(|| async { Err::<(), _>(PipelineError::network("down")) }).await;

        assert_eq!(waiter.calls(), 3);
        assert_eq!(waiter.call_at(0).unwrap(), Duration::from_millis(100));
        assert_eq!(waiter.call_at(1).unwrap(), Duration::from_millis(200));
        assert_eq!(waiter.call_at(2).unwrap(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn rate_limit_retry_after_hint_overrides_backoff() {
        let waiter = RecordingWaiter::new();
        let policy = RetryPolicy::builder()
            .max_attempts(2)
            .unwrap()
            .backoff(RetryBackoff::constant(Duration::from_secs(5)))
            .with_jitter(RetryJitter::None)
            .with_waiter(waiter.clone())
            .build();

        let _ = policy
            .execute(|| async { Err::<(), _>(PipelineError::rate_limit(Some(Duration::from_millis(250)))) })
            .await;

        assert_eq!(waiter.call_at(0).unwrap(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_keeps_failure_tail() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .backoff(RetryBackoff::constant(Duration::from_millis(1)))
            .with_waiter(InstantWaiter)
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PipelineError::network(format!("attempt {attempt}")))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().message.contains("retry exhausted"));
    }
}
