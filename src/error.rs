//! Error types shared across the pipeline.
//!
//! `ErrorKind` is a closed, tagged-variant enum rather than a trait-object
//! hierarchy: every policy in this crate needs to pattern-match on *why*
//! a call failed (retryable? breaker-countable? terminal?), which a boxed
//! `dyn Error` can't answer without downcasting.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside a retry-exhausted error.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Classification of a pipeline failure, independent of its textual message.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Upstream returned 429 or an equivalent rate-limit signal.
    RateLimit { retry_after: Option<Duration> },
    /// Upstream returned a 5xx (or other server-side) error.
    ServerApi { status: u16 },
    /// Upstream returned a 4xx that is not a rate limit (bad request, not found, ...).
    ClientApi { status: u16 },
    /// Transport-level failure: connection refused, DNS, reset, etc.
    Network,
    /// The call did not complete within its allotted timeout.
    Timeout,
    /// The response could not be parsed into the expected shape.
    Validation,
    /// Authentication/authorization failure (401/403).
    Auth,
    /// The circuit breaker refused the call before it started.
    BreakerOpen { failure_count: usize, open_for: Duration },
    /// The batch or item was cancelled cooperatively.
    Cancelled,
    /// Anything else (bug, invariant violation, unexpected state).
    Internal,
}

impl ErrorKind {
    /// Per-component breakers may choose not to count every kind of
    /// failure against their threshold. By default only upstream faults
    /// (server errors and rate limiting) count; network blips and
    /// malformed input do not indicate the service itself is unhealthy.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, ErrorKind::ServerApi { .. } | ErrorKind::RateLimit { .. })
    }
}

/// An error produced while processing one term through one stage.
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn rate_limit(retry_after: Option<Duration>) -> Self {
        Self::new(ErrorKind::RateLimit { retry_after }, "rate limited by upstream")
    }

    pub fn server_api(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerApi { status }, message)
    }

    pub fn client_api(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientApi { status }, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn breaker_open(failure_count: usize, open_for: Duration) -> Self {
        Self::new(
            ErrorKind::BreakerOpen { failure_count, open_for },
            format!("circuit open ({failure_count} failures, open for {open_for:?})"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable_kind(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::ClientApi { .. }
                | ErrorKind::Validation
                | ErrorKind::Auth
                | ErrorKind::Cancelled
                | ErrorKind::BreakerOpen { .. }
        )
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PipelineError {}

/// Exhaustion of a retry budget, carrying the tail of observed failures.
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    pub attempts: usize,
    pub failures: Vec<PipelineError>,
}

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.failures.last().map(|e| e.to_string()).unwrap_or_default();
        write!(
            f,
            "retry exhausted after {} attempts ({} recorded failures), last error: {}",
            self.attempts,
            self.failures.len(),
            last
        )
    }
}

impl std::error::Error for RetryExhausted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures.last().map(|e| e as &dyn std::error::Error)
    }
}
