use crate::adaptive::Adaptive;
use crate::rate_limit::store::TokenStore;
use crate::rate_limit::{Decision, RateLimiter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Refill rate is multiplied by this factor (then floored at `min_rate`)
/// each time `on_rate_limit` fires.
const DECAY_FACTOR: f64 = 0.5;

/// How long a decayed rate takes to linearly recover back to nominal.
const RECOVERY_WINDOW_NANOS: u64 = 60_000_000_000;

/// Base delay used to compute a default cooldown when a 429-class signal
/// doesn't carry its own `retry_after`: `min(60s, 2^hits * base_delay)`.
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(60);

/// Active pause/decay, installed by `on_rate_limit` and consulted (and
/// worn down) by every subsequent `acquire`.
struct PauseState {
    pause_until_nanos: u64,
    decay_started_nanos: u64,
    decay_from: f64,
    decay_to: f64,
}

/// A token bucket rate limiter, one instance per rate-limited resource
/// (in this pipeline: one per `Stage`). Replenishes at `rate` tokens/sec
/// up to `capacity`, backed by a pluggable [`TokenStore`] so the state
/// can live in-process or in a shared external store.
///
/// `rate` is the *effective* refill rate: normally equal to `base_rate`,
/// but temporarily decayed and linearly recovering after `on_rate_limit`.
pub struct TokenBucketLimiter<S> {
    store: Arc<S>,
    bucket_key: String,
    rate: Adaptive<f64>,
    capacity: Adaptive<f64>,
    base_rate: f64,
    min_rate: f64,
    pause: Mutex<Option<PauseState>>,
    consecutive_hits: AtomicU32,
}

impl<S> TokenBucketLimiter<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    pub fn new(store: S, key: impl Into<String>, rate: f64, capacity: f64) -> Self {
        Self {
            store: Arc::new(store),
            bucket_key: key.into(),
            rate: Adaptive::new(rate),
            capacity: Adaptive::new(capacity),
            base_rate: rate,
            min_rate: rate * 0.1,
            pause: Mutex::new(None),
            consecutive_hits: AtomicU32::new(0),
        }
    }

    /// Retune the bucket's rate/capacity without disturbing in-flight acquires.
    pub fn set_rate(&self, rate: f64) {
        self.rate.set(rate);
    }

    pub fn set_capacity(&self, capacity: f64) {
        self.capacity.set(capacity);
    }

    fn now_nanos() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
    }

    /// Applies the pause gate and, if a decay is in progress, interpolates
    /// and installs the recovered rate. Returns `Some(wait)` if the caller
    /// must wait out an active pause before acquiring.
    fn settle_pause(&self, now: u64) -> Option<Duration> {
        let mut guard = self.pause.lock().expect("TokenBucketLimiter.pause: mutex poisoned");
        let state = guard.as_ref()?;

        if now < state.pause_until_nanos {
            return Some(Duration::from_nanos(state.pause_until_nanos - now));
        }

        let elapsed = now.saturating_sub(state.decay_started_nanos);
        if elapsed >= RECOVERY_WINDOW_NANOS {
            self.rate.set(state.decay_to);
            *guard = None;
        } else {
            let frac = elapsed as f64 / RECOVERY_WINDOW_NANOS as f64;
            let recovered = state.decay_from + (state.decay_to - state.decay_from) * frac;
            self.rate.set(recovered);
        }
        None
    }

    fn default_retry_after(&self, hits: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(hits.min(6));
        DEFAULT_RETRY_BASE.saturating_mul(multiplier as u32).min(DEFAULT_RETRY_CAP)
    }
}

#[async_trait]
impl<S> RateLimiter for TokenBucketLimiter<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    async fn acquire(&self, permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
        let now = Self::now_nanos();

        if let Some(wait) = self.settle_pause(now) {
            return Ok(Decision::Denied { wait, reason: "rate_limit_pause".into() });
        }

        let cost = permits as f64;
        let rate = *self.rate.get();
        let capacity = *self.capacity.get();

        for _ in 0..3 {
            let (current_tokens, last_updated) = match self.store.get_state(&self.bucket_key).await? {
                Some((t, u)) => (t, u),
                None => (capacity, now),
            };

            let elapsed_secs = (now.saturating_sub(last_updated) as f64) / 1_000_000_000.0;
            let new_tokens = (current_tokens + elapsed_secs * rate).min(capacity);

            if new_tokens >= cost {
                let final_tokens = new_tokens - cost;
                if self.store.set_state(&self.bucket_key, final_tokens, now, Some(last_updated)).await? {
                    return Ok(Decision::Allowed {
                        remaining: final_tokens as u32,
                        metadata: Default::default(),
                    });
                }
            } else {
                let missing = cost - new_tokens;
                let wait_secs = missing / rate;
                return Ok(Decision::Denied {
                    wait: Duration::from_secs_f64(wait_secs),
                    reason: "token_bucket_empty".into(),
                });
            }
        }

        Ok(Decision::Denied {
            wait: Duration::from_millis(100),
            reason: "store_contention".into(),
        })
    }

    fn on_success(&self) {
        self.consecutive_hits.store(0, Ordering::Relaxed);
    }

    fn on_rate_limit(&self, retry_after: Option<Duration>) {
        let hits = self.consecutive_hits.fetch_add(1, Ordering::Relaxed) + 1;
        let retry_after = retry_after.unwrap_or_else(|| self.default_retry_after(hits));
        let now = Self::now_nanos();
        let current_rate = *self.rate.get();
        let decayed_rate = (current_rate * DECAY_FACTOR).max(self.min_rate);

        self.set_rate(decayed_rate);
        *self.pause.lock().expect("TokenBucketLimiter.pause: mutex poisoned") = Some(PauseState {
            pause_until_nanos: now + retry_after.as_nanos() as u64,
            decay_started_nanos: now,
            decay_from: decayed_rate,
            decay_to: self.base_rate,
        });

        tracing::warn!(
            bucket = %self.bucket_key,
            hits,
            retry_after_ms = retry_after.as_millis() as u64,
            decayed_rate,
            "rate limiter: on_rate_limit, pausing admissions and decaying refill"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::InMemoryTokenStore;

    #[tokio::test]
    async fn allows_up_to_capacity_then_denies() {
        let limiter = TokenBucketLimiter::new(InMemoryTokenStore::new(), "k", 1.0, 2.0);
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(limiter.acquire(1).await.unwrap().is_allowed());
        assert!(!limiter.acquire(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn independent_buckets_do_not_share_state() {
        let store = InMemoryTokenStore::new();
        let a = TokenBucketLimiter::new(store.clone(), "a", 1.0, 1.0);
        let b = TokenBucketLimiter::new(store, "b", 1.0, 1.0);
        assert!(a.acquire(1).await.unwrap().is_allowed());
        assert!(b.acquire(1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn on_rate_limit_pauses_admission_until_retry_after_elapses() {
        let limiter = TokenBucketLimiter::new(InMemoryTokenStore::new(), "k", 10.0, 10.0);
        limiter.on_rate_limit(Some(Duration::from_millis(50)));

        let decision = limiter.acquire(1).await.unwrap();
        match decision {
            Decision::Denied { reason, .. } => assert_eq!(reason, "rate_limit_pause"),
            other => panic!("expected a pause denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn on_rate_limit_decays_rate_with_a_floor() {
        let limiter = TokenBucketLimiter::new(InMemoryTokenStore::new(), "k", 10.0, 10.0);
        limiter.on_rate_limit(Some(Duration::from_millis(0)));
        assert_eq!(*limiter.rate.get(), 5.0);

        // Repeated hits decay further but never below the floor.
        for _ in 0..10 {
            limiter.on_rate_limit(Some(Duration::from_millis(0)));
        }
        assert!(*limiter.rate.get() >= limiter.min_rate);
    }

    #[tokio::test]
    async fn on_success_resets_the_consecutive_hit_counter() {
        let limiter = TokenBucketLimiter::new(InMemoryTokenStore::new(), "k", 10.0, 10.0);
        limiter.on_rate_limit(Some(Duration::from_millis(0)));
        assert_eq!(limiter.consecutive_hits.load(Ordering::Relaxed), 1);

        limiter.on_success();
        assert_eq!(limiter.consecutive_hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn missing_retry_after_falls_back_to_exponential_default() {
        let limiter = TokenBucketLimiter::new(InMemoryTokenStore::new(), "k", 10.0, 10.0);
        limiter.on_rate_limit(None);
        let pause = limiter.pause.lock().unwrap();
        let state = pause.as_ref().unwrap();
        assert!(state.pause_until_nanos > state.decay_started_nanos);
    }
}
