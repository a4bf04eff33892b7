//! Delay curves consulted by [`crate::retry::RetryPolicy`] between attempts.

use std::time::Duration;

/// How the delay between retry attempts grows as attempts accumulate.
#[derive(Debug, Clone)]
pub enum RetryBackoff {
    /// Same delay every attempt.
    Constant { delay: Duration },
    /// Delay grows by a fixed amount per attempt.
    Linear { base: Duration },
    /// Delay doubles each attempt, with an optional ceiling.
    Exponential { base: Duration, max: Option<Duration> },
}

impl RetryBackoff {
    pub fn constant(delay: Duration) -> Self {
        RetryBackoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        RetryBackoff::Linear { base }
    }

    pub fn exponential(base: Duration) -> Self {
        RetryBackoff::Exponential { base, max: None }
    }

    /// Caps an exponential curve; has no effect on the other variants.
    pub fn with_max(mut self, max: Duration) -> Self {
        if let RetryBackoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Delay for the given attempt number (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            RetryBackoff::Constant { delay } => *delay,
            RetryBackoff::Linear { base } => {
                base.checked_mul(attempt as u32).unwrap_or(Duration::from_secs(u64::MAX))
            }
            RetryBackoff::Exponential { base, max } => {
                let exponent = (attempt.saturating_sub(1)) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                let exp_delay = base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX));
                match max {
                    Some(max) => exp_delay.min(*max),
                    None => exp_delay,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = RetryBackoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = RetryBackoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = RetryBackoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1600));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = RetryBackoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_handles_overflow() {
        let backoff = RetryBackoff::exponential(Duration::from_secs(1));
        let delay = backoff.delay(64);
        assert!(delay > Duration::from_secs(1_000_000));
    }

    #[test]
    fn linear_backoff_handles_overflow() {
        let backoff = RetryBackoff::linear(Duration::from_secs(u64::MAX / 2));
        let delay = backoff.delay(10);
        assert!(delay >= Duration::from_secs(u64::MAX / 2));
    }

    #[test]
    fn with_max_only_affects_exponential() {
        let constant = RetryBackoff::constant(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(constant.delay(1), Duration::from_secs(5));

        let linear = RetryBackoff::linear(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(linear.delay(2), Duration::from_secs(10));
    }
}
