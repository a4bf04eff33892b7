use std::fmt;
use std::time::Duration;

/// Structured events emitted while a batch moves through the pipeline.
///
/// Every stage of work — rate limiting, circuit breaking, caching, retrying
/// — emits one of these so a [`super::sinks::TelemetrySink`] can observe,
/// log, or aggregate pipeline behavior without coupling to the policy
/// internals that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A call was denied admission by a rate limiter.
    RateLimited { stage: Stage, wait: Duration },
    /// A circuit breaker tripped open.
    BreakerOpened { service: String, failure_count: usize },
    /// A circuit breaker closed after a successful probe.
    BreakerClosed { service: String },
    /// A circuit breaker let a probe through while half-open.
    BreakerHalfOpen { service: String },
    /// A cache lookup was satisfied without calling the model.
    CacheHit { stage: Stage, tier: CacheTier },
    /// A cache lookup missed and the model was called.
    CacheMiss { stage: Stage },
    /// A failed call is about to be retried.
    Retrying { stage: Stage, attempt: usize, delay: Duration },
    /// One term finished processing (successfully or not).
    ItemCompleted { term: String, success: bool, duration: Duration },
    /// An entire batch finished processing.
    BatchCompleted { total: usize, succeeded: usize, failed: usize, duration: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    One,
    Two,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::One => write!(f, "stage1"),
            Stage::Two => write!(f, "stage2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Disk,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Disk => write!(f, "disk"),
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::RateLimited { stage, wait } => {
                write!(f, "RateLimited({stage}, wait={wait:?})")
            }
            PipelineEvent::BreakerOpened { service, failure_count } => {
                write!(f, "BreakerOpened({service}, failures={failure_count})")
            }
            PipelineEvent::BreakerClosed { service } => write!(f, "BreakerClosed({service})"),
            PipelineEvent::BreakerHalfOpen { service } => write!(f, "BreakerHalfOpen({service})"),
            PipelineEvent::CacheHit { stage, tier } => write!(f, "CacheHit({stage}, {tier})"),
            PipelineEvent::CacheMiss { stage } => write!(f, "CacheMiss({stage})"),
            PipelineEvent::Retrying { stage, attempt, delay } => {
                write!(f, "Retrying({stage}, attempt=#{attempt}, delay={delay:?})")
            }
            PipelineEvent::ItemCompleted { term, success, duration } => {
                write!(f, "ItemCompleted({term}, success={success}, duration={duration:?})")
            }
            PipelineEvent::BatchCompleted { total, succeeded, failed, duration } => write!(
                f,
                "BatchCompleted(total={total}, succeeded={succeeded}, failed={failed}, duration={duration:?})"
            ),
        }
    }
}
