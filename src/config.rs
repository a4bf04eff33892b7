//! Pipeline configuration: the enumerated, defaulted options that
//! [`StageWorker::from_config`](crate::worker::StageWorker::from_config) wires
//! into a runnable worker, and [`PipelineConfig::batch_options`] wires into a
//! [`PipelineOrchestrator`](crate::orchestrator::PipelineOrchestrator) run.

use crate::orchestrator::BatchOptions;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    Fixed,
    Adaptive,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub mode: BreakerMode,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(60), mode: BreakerMode::Fixed }
    }
}

/// Cache tuning. `dir: None` selects tier-1-only ("simple") operation;
/// `dir: Some(path)` adds the filesystem-backed tier 2. Both sit behind the
/// same `Cache` interface — nothing downstream branches on which one is
/// active.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { ttl_seconds: 604_800, max_entries: 10_000, max_bytes: 64 * 1024 * 1024, dir: None }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1_000, max_delay_ms: 300_000 }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    pub stage1_ms: u64,
    pub stage2_ms: u64,
    pub batch_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { stage1_ms: 30_000, stage2_ms: 60_000, batch_ms: 600_000 }
    }
}

/// Top-level pipeline configuration. `PipelineConfig::builder()` clamps
/// and defaults fields the same way a directly-constructed `Default`
/// value would, so either path produces a valid configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrent: usize,
    pub stage1_rate_per_minute: f64,
    pub stage2_rate_per_minute: f64,
    pub rate_burst: u32,
    pub breaker: BreakerSettings,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            stage1_rate_per_minute: 60.0,
            stage2_rate_per_minute: 60.0,
            rate_burst: 10,
            breaker: BreakerSettings::default(),
            cache: CacheSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Builds the [`BatchOptions`] a [`PipelineOrchestrator`](crate::orchestrator::PipelineOrchestrator)
    /// run should use for this configuration's concurrency cap and batch-wide timeout.
    pub fn batch_options(&self, batch_id: impl Into<String>) -> BatchOptions {
        BatchOptions {
            max_concurrent: self.max_concurrent,
            batch_id: batch_id.into(),
            global_timeout: Duration::from_millis(self.timeouts.batch_ms),
        }
    }
}

#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Clamps to 1..=50 per the external interface's stated range.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.max_concurrent = n.clamp(1, 50);
        self
    }

    pub fn stage_rates(mut self, stage1_per_minute: f64, stage2_per_minute: f64) -> Self {
        self.config.stage1_rate_per_minute = stage1_per_minute;
        self.config.stage2_rate_per_minute = stage2_per_minute;
        self
    }

    pub fn rate_burst(mut self, burst: u32) -> Self {
        self.config.rate_burst = burst;
        self
    }

    pub fn breaker(mut self, breaker: BreakerSettings) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn cache(mut self, cache: CacheSettings) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
