use super::events::PipelineEvent;
use async_trait::async_trait;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Consumer of [`PipelineEvent`]s.
///
/// Sinks are best-effort: a pipeline never fails an operation because
/// telemetry delivery failed, it only logs or counts the failure.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    type SinkError: std::error::Error + Send + Sync + 'static;

    async fn emit(&self, event: PipelineEvent) -> Result<(), Self::SinkError>;
}

/// Emits an event and swallows any sink error.
pub async fn emit_best_effort<S>(sink: &S, event: PipelineEvent)
where
    S: TelemetrySink + ?Sized,
{
    let _ = sink.emit(event).await;
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

#[async_trait]
impl TelemetrySink for NullSink {
    type SinkError = Infallible;

    async fn emit(&self, _event: PipelineEvent) -> Result<(), Self::SinkError> {
        Ok(())
    }
}

/// Logs every event through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    type SinkError = Infallible;

    async fn emit(&self, event: PipelineEvent) -> Result<(), Self::SinkError> {
        tracing::info!(event = %event, "pipeline_event");
        Ok(())
    }
}

/// Keeps a bounded ring buffer of events in memory, for tests and dashboards.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().expect("MemorySink.events: mutex poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("MemorySink.events: mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("MemorySink.events: mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    type SinkError = Infallible;

    async fn emit(&self, event: PipelineEvent) -> Result<(), Self::SinkError> {
        let mut guard = self.events.lock().expect("MemorySink.events: mutex poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Fans an event out to two sinks concurrently.
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

#[async_trait]
impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: TelemetrySink + Send + Sync,
    A::SinkError: Send + Sync,
    B: TelemetrySink + Send + Sync,
    B::SinkError: Send + Sync,
{
    type SinkError = ComposedSinkError;

    async fn emit(&self, event: PipelineEvent) -> Result<(), Self::SinkError> {
        let (res_a, res_b) = tokio::join!(self.sink_a.emit(event.clone()), self.sink_b.emit(event));
        res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
        res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
        Ok(())
    }
}

/// Falls back to a secondary sink if the primary fails.
pub struct FallbackSink<A, B> {
    primary: A,
    fallback: B,
}

impl<A, B> FallbackSink<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<A, B> TelemetrySink for FallbackSink<A, B>
where
    A: TelemetrySink + Send + Sync,
    A::SinkError: Send + Sync,
    B: TelemetrySink + Send + Sync,
    B::SinkError: Send + Sync,
{
    type SinkError = ComposedSinkError;

    async fn emit(&self, event: PipelineEvent) -> Result<(), Self::SinkError> {
        match self.primary.emit(event.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => self.fallback.emit(event).await.map_err(|e| ComposedSinkError(Box::new(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::{CacheTier, Stage};
    use std::time::Duration;

    #[tokio::test]
    async fn null_sink_discards() {
        let sink = NullSink;
        sink.emit(PipelineEvent::CacheMiss { stage: Stage::One }).await.unwrap();
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest_past_capacity() {
        let sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        let e1 = PipelineEvent::CacheMiss { stage: Stage::One };
        let e2 = PipelineEvent::CacheHit { stage: Stage::Two, tier: CacheTier::Memory };
        let e3 = PipelineEvent::Retrying { stage: Stage::One, attempt: 1, delay: Duration::from_millis(5) };

        sink.emit(e1.clone()).await.unwrap();
        sink.emit(e2.clone()).await.unwrap();
        sink.emit(e3.clone()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        let events = sink.events();
        assert_eq!(events, vec![e2, e3]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn multicast_sink_delivers_to_both() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let multi = MulticastSink::new(a.clone(), b.clone());

        multi.emit(PipelineEvent::CacheMiss { stage: Stage::One }).await.unwrap();

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    struct Fails;

    #[async_trait]
    impl TelemetrySink for Fails {
        type SinkError = std::io::Error;

        async fn emit(&self, _event: PipelineEvent) -> Result<(), Self::SinkError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "sink down"))
        }
    }

    #[tokio::test]
    async fn fallback_sink_uses_secondary_on_primary_failure() {
        let fallback = MemorySink::new();
        let sink = FallbackSink::new(Fails, fallback.clone());

        sink.emit(PipelineEvent::CacheMiss { stage: Stage::One }).await.unwrap();

        assert_eq!(fallback.len(), 1);
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_errors() {
        emit_best_effort(&Fails, PipelineEvent::CacheMiss { stage: Stage::One }).await;
    }

    #[tokio::test]
    async fn log_sink_does_not_panic() {
        let sink = LogSink;
        sink.emit(PipelineEvent::CacheMiss { stage: Stage::One }).await.unwrap();
    }
}
