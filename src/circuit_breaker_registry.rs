//! Registry for managing named circuit breakers.
//!
//! Allows process-wide access and control (reset/trip/inspection) of circuit
//! breakers by name. The registry itself is an owned value: construct one per
//! service (or per test) and share it through an `Arc`.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker name was not found.
    #[error("circuit breaker '{name}' not found")]
    NotFound {
        /// Name that could not be located.
        name: String,
    },
}

/// Trait for breaker registries (injectable into the gate and load monitor).
pub trait BreakerRegistry: Send + Sync + std::fmt::Debug {
    /// Return the breaker registered under `name`, creating it with `config` on
    /// first reference. Later calls share the first breaker's state and config.
    fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> CircuitBreaker;
    /// Get a breaker by name.
    fn get(&self, name: &str) -> Option<CircuitBreaker>;
    /// Reset a breaker by name, erroring if missing.
    fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError>;
    /// Trip a breaker by name, erroring if missing.
    fn trip(&self, name: &str) -> Result<(), CircuitBreakerRegistryError>;
    /// Snapshot breaker states sorted by name.
    fn snapshot(&self) -> Vec<(String, CircuitState)>;
}

/// In-memory implementation backed by a sharded map.
#[derive(Clone, Debug)]
pub struct InMemoryBreakerRegistry {
    inner: Arc<DashMap<String, CircuitBreaker>>,
    clock: Arc<dyn Clock>,
}

/// Default registry used when none is injected.
pub type DefaultBreakerRegistry = InMemoryBreakerRegistry;

impl Default for InMemoryBreakerRegistry {
    fn default() -> Self {
        Self { inner: Arc::new(DashMap::new()), clock: Arc::new(MonotonicClock::default()) }
    }
}

impl InMemoryBreakerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock handed to breakers created by this registry.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no breaker has been registered.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl BreakerRegistry for InMemoryBreakerRegistry {
    fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(existing) = self.inner.get(name) {
            let breaker = existing.value().clone();
            drop(existing);
            if breaker.config() != config {
                warn!(
                    target: "ninegate::circuit_breaker_registry",
                    name,
                    existing_threshold = breaker.config().failure_threshold(),
                    requested_threshold = config.failure_threshold(),
                    "circuit breaker config differs from existing; keeping first registration"
                );
            }
            return breaker;
        }

        self.inner
            .entry(name.to_string())
            .or_insert_with(|| {
                CircuitBreaker::with_config(name, config.clone())
                    .with_shared_clock(self.clock.clone())
            })
            .value()
            .clone()
    }

    fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.inner.get(name).map(|b| b.value().clone())
    }

    fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(CircuitBreakerRegistryError::NotFound { name: name.to_string() }),
        }
    }

    fn trip(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        match self.get(name) {
            Some(breaker) => {
                breaker.trip();
                Ok(())
            }
            None => Err(CircuitBreakerRegistryError::NotFound { name: name.to_string() }),
        }
    }

    fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut entries: Vec<(String, CircuitState)> =
            self.inner.iter().map(|e| (e.key().clone(), e.value().state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
