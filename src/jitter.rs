//! Randomizes a backoff delay so many concurrent retries don't collide on
//! the same wall-clock instant (a "thundering herd" against the LLM).

use rand::Rng;
use std::time::Duration;

/// How a computed backoff delay is randomized before a retry sleeps on it.
#[derive(Debug, Clone)]
pub enum RetryJitter {
    /// Sleep exactly the computed delay.
    None,
    /// Uniformly random in `[0, delay]`.
    Full,
    /// Uniformly random in `[delay/2, delay]`.
    Equal,
    /// AWS-style decorrelated jitter, bounded by `[base, max]`.
    Decorrelated { base: Duration, max: Duration },
}

impl RetryJitter {
    pub fn full() -> Self {
        RetryJitter::Full
    }

    pub fn equal() -> Self {
        RetryJitter::Equal
    }

    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        RetryJitter::Decorrelated { base, max }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Same as [`apply`](Self::apply) but with an injectable RNG, for
    /// deterministic tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            RetryJitter::None => delay,
            RetryJitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.gen_range(0..=millis))
            }
            RetryJitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                Duration::from_millis(rng.gen_range(half..=millis))
            }
            RetryJitter::Decorrelated { base, max } => {
                let base_millis = base.as_millis() as u64;
                let delay_millis = delay.as_millis() as u64;
                let max_millis = max.as_millis() as u64;

                let upper = delay_millis.saturating_mul(3);
                let range_max = upper.min(max_millis);

                if base_millis >= range_max {
                    return Duration::from_millis(base_millis);
                }
                Duration::from_millis(rng.gen_range(base_millis..=range_max))
            }
        }
    }
}
