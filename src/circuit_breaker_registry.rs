//! Registry mapping a service name to its circuit breaker, created lazily.
//!
//! A pipeline can front more than one upstream (e.g. a primary and a
//! fallback model provider); each gets its own independently-tripping
//! breaker, looked up by name.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreakerPolicy>>>,
    default_config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), default_config }
    }

    /// Fetch the breaker for `service`, creating one with the registry's
    /// default config on first use.
    pub fn get_or_create(&self, service: &str) -> CircuitBreakerPolicy {
        let mut guard = self.inner.lock().expect("breaker registry mutex poisoned");
        guard
            .entry(service.to_string())
            .or_insert_with(|| CircuitBreakerPolicy::with_config(self.default_config.clone()))
            .clone()
    }

    pub fn reset(&self, service: &str) -> Result<(), String> {
        let guard = self.inner.lock().expect("breaker registry mutex poisoned");
        match guard.get(service) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(format!("no breaker registered for service: {service}")),
        }
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let guard = self.inner.lock().expect("breaker registry mutex poisoned");
        let mut entries: Vec<_> = guard.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lazily_creates_and_reuses_breakers_per_service() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::new(3, Duration::from_secs(1)));
        let a1 = registry.get_or_create("stage1-llm");
        let a2 = registry.get_or_create("stage1-llm");
        let b = registry.get_or_create("stage2-llm");

        a1.reset();
        assert_eq!(a2.state(), CircuitState::Closed, "same handle across calls for the same service");
        assert_ne!(registry.snapshot().len(), 0);
        let _ = b;
    }

    #[test]
    fn reset_unknown_service_errors() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::new(3, Duration::from_secs(1)));
        assert!(registry.reset("missing").is_err());
    }
}
