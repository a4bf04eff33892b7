//! Rate limiting primitives.
//!
//! - [`RateLimiter`]: the core trait for admission control.
//! - [`strategies::TokenBucketLimiter`]: the production token-bucket implementation.
//! - [`store::TokenStore`]: pluggable state storage (in-memory by default, a
//!   distributed backend can be substituted without touching the bucket math).
//!
//! Stage 1 and Stage 2 calls are rate-limited independently: each
//! `TokenBucketLimiter` is keyed to one `Stage`, so exhausting the Stage 1
//! budget never blocks Stage 2 work.

use std::collections::HashMap;
use std::time::Duration;

pub mod store;
pub mod strategies;

pub use strategies::TokenBucketLimiter;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed { remaining: u32, metadata: HashMap<String, String> },
    Denied { wait: Duration, reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for admission control, decoupled from the bucket
/// implementation and its storage backend.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self, permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>>;

    /// Advisory: a guarded call completed without being rate-limited. May
    /// be used by adaptive implementations to recover faster; a limiter
    /// that never decays is free to no-op.
    fn on_success(&self);

    /// Upstream told us we exceeded its limit. `retry_after` is the
    /// signaled cooldown, if the upstream provided one; implementations
    /// that track their own consecutive-hit count should fall back to an
    /// exponential default when it is absent.
    fn on_rate_limit(&self, retry_after: Option<Duration>);
}
