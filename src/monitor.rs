//! Batch and item metrics, consumed write-only by the orchestrator.
//!
//! Grounded on the original Python pipeline's `ConcurrentProcessingMonitor`:
//! counters behind a lock, a per-batch summary dict, and JSON export --
//! without its SQLite persistence, which is left to a `BatchRecorder`
//! implementation wrapping an actual store.

use crate::types::BatchMetrics;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait BatchRecorder: Send + Sync {
    async fn record_batch_start(&self, batch_id: &str, total_items: usize, max_concurrent: usize);
    async fn record_batch_end(&self, batch_id: &str, metrics: &BatchMetrics);
    async fn record_item_result(
        &self,
        batch_id: &str,
        position: u32,
        success: bool,
        duration_ms: u64,
        error_kind: Option<&str>,
    );
}

/// Discards everything. Used where a `BatchRecorder` is required but no
/// metrics sink is configured.
pub struct NullRecorder;

#[async_trait]
impl BatchRecorder for NullRecorder {
    async fn record_batch_start(&self, _batch_id: &str, _total_items: usize, _max_concurrent: usize) {}
    async fn record_batch_end(&self, _batch_id: &str, _metrics: &BatchMetrics) {}
    async fn record_item_result(&self, _: &str, _: u32, _: bool, _: u64, _: Option<&str>) {}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total_items: usize,
    pub max_concurrent: usize,
    pub metrics: Option<BatchMetrics>,
}

/// In-process recorder keeping per-batch summaries for JSON export and a
/// running performance report across all batches.
#[derive(Default)]
pub struct InMemoryRecorder {
    batches: Mutex<HashMap<String, BatchSummary>>,
    concurrent_high_water_mark: AtomicUsize,
    total_items_processed: AtomicU64,
    total_successful: AtomicU64,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_concurrency(&self, count: usize) {
        self.concurrent_high_water_mark.fetch_max(count, Ordering::AcqRel);
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        let guard = self.batches.lock().expect("monitor mutex poisoned");
        let snapshot: Vec<&BatchSummary> = guard.values().collect();
        serde_json::to_string_pretty(&snapshot)
    }

    pub fn performance_report(&self) -> String {
        let processed = self.total_items_processed.load(Ordering::Acquire);
        let successful = self.total_successful.load(Ordering::Acquire);
        let success_rate = if processed > 0 { successful as f64 / processed as f64 * 100.0 } else { 0.0 };
        format!(
            "Total Items Processed: {processed}\nSuccess Rate: {success_rate:.1}%\nMax Concurrent Processing: {}",
            self.concurrent_high_water_mark.load(Ordering::Acquire)
        )
    }
}

#[async_trait]
impl BatchRecorder for InMemoryRecorder {
    async fn record_batch_start(&self, batch_id: &str, total_items: usize, max_concurrent: usize) {
        let mut guard = self.batches.lock().expect("monitor mutex poisoned");
        guard.insert(
            batch_id.to_string(),
            BatchSummary { batch_id: batch_id.to_string(), total_items, max_concurrent, metrics: None },
        );
    }

    async fn record_batch_end(&self, batch_id: &str, metrics: &BatchMetrics) {
        let mut guard = self.batches.lock().expect("monitor mutex poisoned");
        if let Some(summary) = guard.get_mut(batch_id) {
            summary.metrics = Some(metrics.clone());
        }
    }

    async fn record_item_result(
        &self,
        _batch_id: &str,
        _position: u32,
        success: bool,
        _duration_ms: u64,
        _error_kind: Option<&str>,
    ) {
        self.total_items_processed.fetch_add(1, Ordering::AcqRel);
        if success {
            self.total_successful.fetch_add(1, Ordering::AcqRel);
        }
    }
}
