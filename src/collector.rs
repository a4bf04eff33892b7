//! Collects results keyed by position, arriving in any order, and restores
//! position order at retrieval time.
//!
//! Mirrors the original Python pipeline's `OrderedResultsCollector`
//! (`asyncio.Lock` + `asyncio.Event`), re-expressed on top of
//! `tokio::sync::{Mutex, Notify}`. Gaps are filled with synthetic
//! `ProcessingResult::missing` entries only when results are read, never
//! during insertion, so a slow worker never blocks the collector.

use crate::types::ProcessingResult;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    pub total_expected: usize,
    pub total_collected: usize,
    pub successful: usize,
    pub failed: usize,
    pub from_cache: usize,
    pub elapsed: Duration,
}

struct Inner {
    results: HashMap<u32, ProcessingResult>,
    expected: usize,
    started_at: Option<Instant>,
}

/// Thread-safe position-keyed result buffer for one batch.
pub struct OrderedCollector {
    inner: Mutex<Inner>,
    completion: Notify,
}

impl OrderedCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { results: HashMap::new(), expected: 0, started_at: None }),
            completion: Notify::new(),
        }
    }

    pub async fn set_expected(&self, count: usize) {
        let mut guard = self.inner.lock().await;
        guard.expected = count;
        guard.started_at = Some(Instant::now());
        if count == 0 {
            drop(guard);
            self.completion.notify_waiters();
        }
    }

    /// Inserts a result at `position`. Returns an error on a duplicate
    /// position — a programmer-error guard, not a spec-mandated race (the
    /// orchestrator never assigns the same position to two workers).
    pub async fn add(&self, position: u32, result: ProcessingResult) -> Result<(), String> {
        let mut guard = self.inner.lock().await;
        if guard.results.contains_key(&position) {
            return Err(format!("duplicate result for position {position}"));
        }
        guard.results.insert(position, result);
        let completed = guard.results.len();
        let expected = guard.expected;
        drop(guard);

        if completed >= expected {
            self.completion.notify_waiters();
        }
        Ok(())
    }

    /// Waits until `expected` results have been added, or `timeout` elapses.
    ///
    /// The `notified()` future is created before the completion check so a
    /// `notify_waiters` fired between the check and the await is not
    /// missed — Tokio guarantees a `Notified` registered before a
    /// `notify_waiters` call still observes it.
    pub async fn wait_for_all(&self, timeout: Duration) -> bool {
        let notified = self.completion.notified();

        {
            let guard = self.inner.lock().await;
            if guard.results.len() >= guard.expected {
                return true;
            }
        }

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => {
                let guard = self.inner.lock().await;
                guard.results.len() >= guard.expected
            }
        }
    }

    /// Returns results ordered 1..=expected, synthesizing a `missing`
    /// entry for any position never added.
    pub async fn ordered_results(&self) -> Vec<ProcessingResult> {
        let guard = self.inner.lock().await;
        let max_position = guard.expected.max(guard.results.keys().copied().map(|p| p as usize).max().unwrap_or(0));

        let mut ordered = Vec::with_capacity(max_position);
        for position in 1..=max_position as u32 {
            match guard.results.get(&position) {
                Some(result) => ordered.push(result.clone()),
                None => ordered.push(ProcessingResult::missing(position)),
            }
        }
        ordered
    }

    pub async fn stats(&self) -> CollectorStats {
        let guard = self.inner.lock().await;
        let successful = guard.results.values().filter(|r| r.ok).count();
        let failed = guard.results.values().filter(|r| !r.ok).count();
        let from_cache = guard.results.values().filter(|r| r.from_cache).count();
        let elapsed = guard.started_at.map(|t| t.elapsed()).unwrap_or_default();

        CollectorStats {
            total_expected: guard.expected,
            total_collected: guard.results.len(),
            successful,
            failed,
            from_cache,
            elapsed,
        }
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.results.clear();
        guard.expected = 0;
        guard.started_at = None;
    }
}

impl Default for OrderedCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ok_result(position: u32) -> ProcessingResult {
        ProcessingResult {
            position,
            term: format!("term-{position}"),
            ok: true,
            flashcards: None,
            error: None,
            from_cache: false,
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_position_is_rejected() {
        let collector = OrderedCollector::new();
        collector.set_expected(2).await;
        collector.add(1, ok_result(1)).await.unwrap();
        assert!(collector.add(1, ok_result(1)).await.is_err());
    }

    #[tokio::test]
    async fn ordered_results_fills_gaps_with_missing_entries() {
        let collector = OrderedCollector::new();
        collector.set_expected(3).await;
        collector.add(1, ok_result(1)).await.unwrap();
        collector.add(3, ok_result(3)).await.unwrap();

        let results = collector.ordered_results().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].position, 1);
        assert!(results[1].error.is_some());
        assert_eq!(results[2].position, 3);
    }

    #[tokio::test]
    async fn wait_for_all_resolves_once_expected_count_is_reached() {
        let collector = Arc::new(OrderedCollector::new());
        collector.set_expected(2).await;

        let waiter = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.wait_for_all(Duration::from_secs(5)).await })
        };

        collector.add(1, ok_result(1)).await.unwrap();
        collector.add(2, ok_result(2)).await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_all_times_out_when_incomplete() {
        let collector = OrderedCollector::new();
        collector.set_expected(2).await;
        collector.add(1, ok_result(1)).await.unwrap();

        assert!(!collector.wait_for_all(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn stats_reports_success_failure_and_cache_counts() {
        let collector = OrderedCollector::new();
        collector.set_expected(2).await;
        collector.add(1, ok_result(1)).await.unwrap();
        let mut cached = ok_result(2);
        cached.from_cache = true;
        collector.add(2, cached).await.unwrap();

        let stats = collector.stats().await;
        assert_eq!(stats.total_collected, 2);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.from_cache, 1);
    }

    #[tokio::test]
    async fn clear_resets_state() {
        let collector = OrderedCollector::new();
        collector.set_expected(1).await;
        collector.add(1, ok_result(1)).await.unwrap();
        collector.clear().await;

        let stats = collector.stats().await;
        assert_eq!(stats.total_collected, 0);
        assert_eq!(stats.total_expected, 0);
    }
}
