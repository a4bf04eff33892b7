//! Per-service circuit breaker with lock-free atomics.
//!
//! The state machine (closed/open/half-open) and its CAS transitions are
//! unchanged from a classical breaker; the addition here is an adaptive
//! failure threshold that shrinks when the breaker trips and grows back
//! after a run of clean closed-state calls, so a flaky upstream doesn't
//! keep tripping at the same fixed count forever.

use crate::clock::{Clock, SystemClock};
use crate::error::{ErrorKind, PipelineError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tuning for the adaptive threshold. Defaults match the values recorded
/// as an open-question resolution rather than a grounded constant.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveConfig {
    pub shrink_factor: f64,
    pub grow_step: usize,
    pub min_threshold: usize,
    pub max_threshold: usize,
    pub success_streak_to_grow: usize,
}

impl AdaptiveConfig {
    pub fn fixed() -> Self {
        Self {
            shrink_factor: 1.0,
            grow_step: 0,
            min_threshold: usize::MAX,
            max_threshold: usize::MAX,
            success_streak_to_grow: usize::MAX,
        }
    }

    pub fn for_threshold(base_threshold: usize) -> Self {
        Self {
            shrink_factor: 0.5,
            grow_step: 1,
            min_threshold: 2,
            max_threshold: base_threshold.saturating_mul(2).max(2),
            success_streak_to_grow: 5,
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: usize,
    pub adaptive: AdaptiveConfig,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls: 1,
            adaptive: AdaptiveConfig::fixed(),
        }
    }

    pub fn adaptive(mut self) -> Self {
        self.adaptive = AdaptiveConfig::for_threshold(self.failure_threshold);
        self
    }

    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            half_open_max_calls: usize::MAX,
            adaptive: AdaptiveConfig::fixed(),
        }
    }
}

struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    current_threshold: AtomicUsize,
    success_streak: AtomicUsize,
}

impl CircuitBreakerState {
    fn new(failure_threshold: usize) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
            current_threshold: AtomicUsize::new(failure_threshold),
            success_streak: AtomicUsize::new(0),
        }
    }

    pub(crate) fn reset(&self, failure_threshold: usize) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.current_threshold.store(failure_threshold, Ordering::Release);
        self.success_streak.store(0, Ordering::Release);
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerPolicy {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig::new(failure_threshold, recovery_timeout))
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState::new(config.failure_threshold)),
            config,
            clock: Arc::new(SystemClock::default()),
        }
    }

    /// Override the clock (used in tests to avoid real sleeps).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_half_open_limit(mut self, limit: usize) -> Self {
        self.config.half_open_max_calls = limit;
        self
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    pub fn reset(&self) {
        self.state.reset(self.config.failure_threshold);
    }

    pub(crate) fn shared_state(&self) -> Arc<CircuitBreakerState> {
        self.state.clone()
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, PipelineError>
    where
        T: Send,
        Fut: Future<Output = Result<T, PipelineError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker -> half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("invalid state transition"),
                        }
                    } else {
                        return Err(PipelineError::breaker_open(
                            self.state.failure_count.load(Ordering::Acquire),
                            Duration::from_millis(elapsed),
                        ));
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(PipelineError::breaker_open(
                            self.state.failure_count.load(Ordering::Acquire),
                            Duration::from_millis(0),
                        ));
                    }
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(e) => self.on_failure(e),
        }

        result
    }

    fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    self.state.success_streak.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
                self.maybe_grow_threshold();
            }
            _ => {}
        }
    }

    fn on_failure(&self, err: &PipelineError) {
        if !err.kind.counts_toward_breaker() {
            return;
        }

        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.success_streak.store(0, Ordering::Release);

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: half-open probe failed -> open");
                }
            }
            STATE_CLOSED => {
                let threshold = self.state.current_threshold.load(Ordering::Acquire);
                if failures >= threshold {
                    if self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                        self.shrink_threshold();
                        tracing::error!(failures, threshold, "circuit breaker -> open");
                    }
                }
            }
            _ => {}
        }
    }

    fn shrink_threshold(&self) {
        let adaptive = &self.config.adaptive;
        if adaptive.shrink_factor >= 1.0 {
            return;
        }
        let current = self.state.current_threshold.load(Ordering::Acquire);
        let shrunk = ((current as f64) * adaptive.shrink_factor).floor() as usize;
        let next = shrunk.max(adaptive.min_threshold);
        self.state.current_threshold.store(next, Ordering::Release);
    }

    fn maybe_grow_threshold(&self) {
        let adaptive = &self.config.adaptive;
        if adaptive.grow_step == 0 {
            return;
        }
        let streak = self.state.success_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak % adaptive.success_streak_to_grow == 0 {
            let current = self.state.current_threshold.load(Ordering::Acquire);
            let grown = (current + adaptive.grow_step).min(adaptive.max_threshold);
            self.state.current_threshold.store(grown, Ordering::Release);
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
