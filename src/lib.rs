#![forbid(unsafe_code)]

//! # flashpipe
//!
//! A concurrent two-stage LLM pipeline orchestrator: rate limiting, circuit
//! breaking, two-tier caching, and order-preserving delivery.
//!
//! ## Features
//!
//! - **Rate limiting** per pipeline stage via an independent token bucket per stage
//! - **Circuit breakers** with adaptive thresholds and half-open recovery probes
//! - **Two-tier caching** (in-process LRU, content-addressed filesystem) to avoid
//!   re-paying for identical model calls
//! - **Retry policies** with backoff/jitter, gated by error classification
//! - **Order-preserving collection** of results processed out of order by a worker pool
//! - **Structured telemetry** for every policy decision
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use flashpipe::{CircuitBreakerPolicy, PipelineError, RetryBackoff, RetryJitter, RetryPolicy};
//!
//! async fn flaky_call(attempts: Arc<AtomicUsize>) -> Result<(), PipelineError> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(PipelineError::server_api(503, "transient failure"))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("valid attempt count")
//!         .backoff(RetryBackoff::exponential(Duration::from_millis(200)))
//!         .with_jitter(RetryJitter::full())
//!         .build();
//!     let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30));
//!
//!     breaker
//!         .execute(|| retry.execute(|| flaky_call(attempts.clone())))
//!         .await?;
//!     Ok(())
//! }
//! ```

mod adaptive;
mod backoff;
mod cache;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod collector;
mod config;
mod error;
mod jitter;
mod llm_client;
mod monitor;
mod orchestrator;
mod progress;
mod rate_limit;
mod retry;
pub mod telemetry;
mod timeout;
mod types;
mod worker;

pub use adaptive::Adaptive;
pub use backoff::RetryBackoff;
pub use cache::{stage1_cache_key, stage2_cache_key, Cache, CacheConfig, CacheStats};
pub use circuit_breaker::{AdaptiveConfig, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use circuit_breaker_registry::BreakerRegistry;
pub use clock::{Clock, InstantWaiter, ManualClock, RecordingWaiter, RetryWaiter, SystemClock, TokioWaiter};
pub use collector::{CollectorStats, OrderedCollector};
pub use config::{
    BreakerMode, BreakerSettings, CacheSettings, PipelineConfig, PipelineConfigBuilder, RetrySettings,
    TimeoutSettings,
};
pub use error::{ErrorKind, PipelineError, RetryExhausted, MAX_RETRY_FAILURES};
pub use jitter::RetryJitter;
pub use llm_client::{LlmClient, ReqwestLlmClient};
pub use monitor::{BatchRecorder, BatchSummary, InMemoryRecorder, NullRecorder};
pub use orchestrator::{BatchOptions, CancelSignal, PipelineOrchestrator};
pub use progress::{ProgressStats, ProgressTracker};
pub use rate_limit::{store, strategies, Decision, RateLimiter, TokenBucketLimiter};
pub use retry::{BuildError, RetryDecision, RetryPolicy, RetryPolicyBuilder};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
pub use types::{
    BatchMetrics, CacheEntry, Comparison, FlashcardRow, MnemonicStructure, ProcessingResult,
    ResultError, Stage, Stage1Result, Stage2Result, Term, Usage,
};
pub use worker::StageWorker;
