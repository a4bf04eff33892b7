//! Lock-free handles for live-updatable config.
//!
//! Rate limits and breaker thresholds can be retuned while the orchestrator
//! is running a batch; `Adaptive<T>` gives cheap reads and atomic swaps so
//! in-flight workers never observe a torn update.

use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug)]
pub struct Adaptive<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Adaptive<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Adaptive<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of an `Arc`).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure, reading the current value and storing the result.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let cur = self.inner.load_full();
        let new_val = f(&cur);
        self.inner.store(Arc::new(new_val));
    }
}
