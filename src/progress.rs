//! Progress tracking for a batch in flight.
//!
//! Grounded on the original Python pipeline's `ConcurrentProgressTracker`:
//! counters behind a single lock, callbacks fired on every `start_item`/
//! `complete_item`, dispatched without holding that lock (here via
//! `tokio::spawn` per callback rather than the original's executor
//! hand-off, so a slow callback never stalls the next state update).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ProgressStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub remaining: usize,
    pub progress_percent: f64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub elapsed: Duration,
    pub completion_rate: f64,
    pub eta: Duration,
    pub average_item_duration: Duration,
}

struct Inner {
    total: usize,
    completed: usize,
    failed: usize,
    in_progress: HashSet<u32>,
    start_times: HashMap<u32, Instant>,
    item_durations: Vec<Duration>,
    cached_count: usize,
    started_at: Instant,
}

impl Inner {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            failed: 0,
            in_progress: HashSet::new(),
            start_times: HashMap::new(),
            item_durations: Vec::new(),
            cached_count: 0,
            started_at: Instant::now(),
        }
    }

    fn stats(&self) -> ProgressStats {
        let elapsed = self.started_at.elapsed();
        let processed = self.completed + self.failed;
        let remaining = self.total.saturating_sub(processed);
        let completion_rate =
            if elapsed.as_secs_f64() > 0.0 { self.completed as f64 / elapsed.as_secs_f64() } else { 0.0 };
        let eta_secs = if completion_rate > 0.0 { remaining as f64 / completion_rate } else { 0.0 };
        let average_item_duration = if self.item_durations.is_empty() {
            Duration::ZERO
        } else {
            self.item_durations.iter().sum::<Duration>() / self.item_durations.len() as u32
        };

        ProgressStats {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            in_progress: self.in_progress.len(),
            remaining,
            progress_percent: if self.total > 0 { processed as f64 / self.total as f64 * 100.0 } else { 0.0 },
            success_rate: if processed > 0 { self.completed as f64 / processed as f64 * 100.0 } else { 100.0 },
            cache_hit_rate: if self.completed > 0 {
                self.cached_count as f64 / self.completed as f64 * 100.0
            } else {
                0.0
            },
            elapsed,
            completion_rate,
            eta: Duration::from_secs_f64(eta_secs.max(0.0)),
            average_item_duration,
        }
    }
}

type Callback = Arc<dyn Fn(ProgressStats) + Send + Sync>;

/// Tracks start/completion of items in one batch and fans stats out to
/// registered callbacks.
pub struct ProgressTracker {
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<Callback>>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self { inner: Mutex::new(Inner::new(total)), callbacks: Mutex::new(Vec::new()) }
    }

    pub async fn add_callback<F>(&self, callback: F)
    where
        F: Fn(ProgressStats) + Send + Sync + 'static,
    {
        self.callbacks.lock().await.push(Arc::new(callback));
    }

    pub async fn start_item(&self, position: u32) {
        let stats = {
            let mut guard = self.inner.lock().await;
            guard.in_progress.insert(position);
            guard.start_times.insert(position, Instant::now());
            guard.stats()
        };
        self.notify(stats).await;
    }

    pub async fn complete_item(&self, position: u32, success: bool, from_cache: bool) {
        let stats = {
            let mut guard = self.inner.lock().await;
            guard.in_progress.remove(&position);
            if let Some(started) = guard.start_times.remove(&position) {
                guard.item_durations.push(started.elapsed());
            }
            if success {
                guard.completed += 1;
                if from_cache {
                    guard.cached_count += 1;
                }
            } else {
                guard.failed += 1;
            }
            guard.stats()
        };
        self.notify(stats).await;
    }

    pub async fn get_stats(&self) -> ProgressStats {
        self.inner.lock().await.stats()
    }

    pub async fn get_summary(&self) -> String {
        let stats = self.get_stats().await;
        let mut lines = vec![
            format!(
                "Progress: {:.1}% ({}/{})",
                stats.progress_percent,
                stats.completed + stats.failed,
                stats.total
            ),
            format!("Success Rate: {:.1}%", stats.success_rate),
            format!("Cache Hit Rate: {:.1}%", stats.cache_hit_rate),
            format!("Average Time: {}ms per item", stats.average_item_duration.as_millis()),
            format!("Completion Rate: {:.1} items/second", stats.completion_rate),
        ];
        if stats.failed > 0 {
            lines.push(format!("Failed Items: {}", stats.failed));
        }
        if stats.eta > Duration::ZERO {
            let secs = stats.eta.as_secs();
            lines.push(format!("ETA: {}m {}s", secs / 60, secs % 60));
        }
        lines.join("\n")
    }

    pub async fn reset(&self, total: usize) {
        *self.inner.lock().await = Inner::new(total);
    }

    async fn notify(&self, stats: ProgressStats) {
        let callbacks = self.callbacks.lock().await.clone();
        for callback in callbacks {
            let stats = stats.clone();
            tokio::spawn(async move { callback(stats) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn start_then_complete_updates_counters() {
        let tracker = ProgressTracker::new(2);
        tracker.start_item(1).await;
        tracker.complete_item(1, true, false).await;

        let stats = tracker.get_stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_progress, 0);
    }

    #[tokio::test]
    async fn cache_hit_rate_counts_only_cached_successes() {
        let tracker = ProgressTracker::new(2);
        tracker.complete_item(1, true, true).await;
        tracker.complete_item(2, true, false).await;

        let stats = tracker.get_stats().await;
        assert_eq!(stats.cache_hit_rate, 50.0);
    }

    #[tokio::test]
    async fn failed_items_lower_success_rate() {
        let tracker = ProgressTracker::new(2);
        tracker.complete_item(1, true, false).await;
        tracker.complete_item(2, false, false).await;

        let stats = tracker.get_stats().await;
        assert_eq!(stats.success_rate, 50.0);
    }

    #[tokio::test]
    async fn callbacks_fire_without_blocking_the_caller() {
        let tracker = ProgressTracker::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        tracker
            .add_callback(move |_stats| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tracker.complete_item(1, true, false).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let tracker = ProgressTracker::new(1);
        tracker.complete_item(1, true, false).await;
        tracker.reset(5).await;

        let stats = tracker.get_stats().await;
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 0);
    }
}
