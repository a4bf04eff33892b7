//! Batch fan-out: a bounded worker pool pulling from a shared, position
//! ordered queue, cooperative cancellation, and order-restoring collection.
//!
//! Re-expresses the original Python pipeline's `asyncio.gather` fan-out
//! (`pipeline_orchestrator.py`) as a fixed-size `tokio::spawn` pool over a
//! `tokio::sync::Mutex<VecDeque<Term>>`, since nothing in the retrievable
//! source actually implements the `ConcurrentPipelineOrchestrator`/
//! semaphore variant its imports reference.

use crate::llm_client::LlmClient;
use crate::monitor::BatchRecorder;
use crate::progress::ProgressTracker;
use crate::telemetry::{emit_best_effort, PipelineEvent, TelemetrySink};
use crate::types::{BatchMetrics, ProcessingResult, Term};
use crate::worker::StageWorker;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// Cooperative cancellation flag shared by every worker in a batch.
/// `Clone` is cheap (an `Arc` bump); all clones observe the same signal.
#[derive(Clone)]
pub struct CancelSignal(Arc<CancelInner>);

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(CancelInner { flag: AtomicBool::new(false), notify: Notify::new() }))
    }

    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::Acquire)
    }

    /// Resolves immediately if already cancelled, otherwise waits for
    /// `cancel()`. Registers its `Notified` before the re-check, the same
    /// race-safe pattern `OrderedCollector::wait_for_all` uses.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.0.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_concurrent: usize,
    pub batch_id: String,
    pub global_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { max_concurrent: 20, batch_id: "batch".to_string(), global_timeout: Duration::from_secs(600) }
    }
}

/// Drives one batch of terms through a [`StageWorker`] pool and returns
/// results restored to input order.
pub struct PipelineOrchestrator<L, T> {
    worker: Arc<StageWorker<L, T>>,
    recorder: Arc<dyn BatchRecorder>,
    telemetry: Arc<T>,
}

impl<L, T> PipelineOrchestrator<L, T>
where
    L: LlmClient + 'static,
    T: TelemetrySink + 'static,
{
    pub fn new(worker: Arc<StageWorker<L, T>>, recorder: Arc<dyn BatchRecorder>, telemetry: Arc<T>) -> Self {
        Self { worker, recorder, telemetry }
    }

    pub async fn process_batch(
        &self,
        terms: Vec<Term>,
        options: BatchOptions,
        cancel: CancelSignal,
    ) -> Vec<ProcessingResult> {
        let total = terms.len();
        let batch_start = Instant::now();
        self.recorder.record_batch_start(&options.batch_id, total, options.max_concurrent).await;

        let collector = Arc::new(crate::collector::OrderedCollector::new());
        collector.set_expected(total).await;
        let progress = Arc::new(ProgressTracker::new(total));

        let pool_size = options.max_concurrent.max(1).min(total.max(1));
        let queue = Arc::new(Mutex::new(VecDeque::from(terms)));

        let mut handles = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let worker = self.worker.clone();
            let queue = queue.clone();
            let collector = collector.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            let recorder = self.recorder.clone();
            let batch_id = options.batch_id.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let term = match queue.lock().await.pop_front() {
                        Some(term) => term,
                        None => break,
                    };
                    let position = term.position;
                    let start = Instant::now();

                    let result = if cancel.is_cancelled() {
                        ProcessingResult::failure(
                            position,
                            term.term.clone(),
                            &crate::error::PipelineError::cancelled(),
                            start.elapsed(),
                        )
                    } else {
                        worker.process_term(term, cancel.clone(), progress.as_ref()).await
                    };

                    recorder
                        .record_item_result(
                            &batch_id,
                            position,
                            result.ok,
                            result.duration_ms,
                            result.error.as_ref().map(|e| e.kind.as_str()),
                        )
                        .await;
                    let _ = collector.add(position, result).await;
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        collector.wait_for_all(options.global_timeout).await;
        let results = collector.ordered_results().await;
        let collector_stats = collector.stats().await;

        let metrics = BatchMetrics {
            total,
            succeeded: collector_stats.successful,
            failed: collector_stats.failed,
            cache_hits: collector_stats.from_cache,
            concurrency_high_water_mark: pool_size,
            start_ms: 0,
            end_ms: batch_start.elapsed().as_millis() as u64,
            ..Default::default()
        };
        self.recorder.record_batch_end(&options.batch_id, &metrics).await;
        emit_best_effort(
            self.telemetry.as_ref(),
            PipelineEvent::BatchCompleted {
                total,
                succeeded: metrics.succeeded,
                failed: metrics.failed,
                duration: batch_start.elapsed(),
            },
        )
        .await;

        results
    }
}
