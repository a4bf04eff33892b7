//! Telemetry and observability for the pipeline.
//!
//! Every policy (rate limiter, breaker, cache, retry) emits a
//! [`PipelineEvent`] describing what it did. Events flow through
//! [`TelemetrySink`] implementations, which can log, aggregate in memory,
//! or fan out to multiple destinations.

pub mod events;
pub mod sinks;

pub use events::{CacheTier, PipelineEvent, Stage};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NullSink, TelemetrySink,
};
