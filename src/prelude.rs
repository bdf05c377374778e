//! Convenient re-exports for common ninegate types.
pub use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    circuit_breaker_registry::{BreakerRegistry, InMemoryBreakerRegistry},
    config::{AdmissionConfig, RateLimitRule},
    error::AdmissionError,
    gate::{AdmissionGate, AdmissionLayer, GateError, Principal, RequestMeta},
    limiter::{Decision, LimiterKey, WindowedLimiter},
    load::{LoadMonitor, LoadProbe},
    quota::{QuotaOracle, StaticQuotaOracle},
};
