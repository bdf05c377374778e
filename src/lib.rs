#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ninegate
//!
//! Adaptive admission control for request-handling services: daily quotas,
//! per-key fixed-window rate limits that shrink under system load, and a
//! system-wide circuit breaker that sheds untrusted traffic when the host is
//! saturated.
//!
//! ## Features
//!
//! - **Windowed limiter** keyed by `(principal, endpoint)`, linearizable per key
//! - **Load monitor** sampling CPU and memory on a debounced ticker
//! - **Circuit breakers** with lock-free state and a named registry
//! - **Quota oracle** trait for subscription-backed quotas and trusted accounts
//! - **Tower middleware** emitting `X-RateLimit-*` and `Retry-After` headers
//! - **Live configuration** swapped atomically at runtime
//!
//! ## Quick Start
//!
//! ```rust
//! use ninegate::{AdmissionConfig, AdmissionGate, RequestMeta, StaticQuotaOracle, UnavailableProbe};
//!
//! #[tokio::main]
//! async fn main() {
//!     let gate = AdmissionGate::builder()
//!         .config(AdmissionConfig::default())
//!         .oracle(StaticQuotaOracle::new().with_trusted("ops"))
//!         .probe(UnavailableProbe)
//!         .build()
//!         .expect("valid config");
//!
//!     let meta = RequestMeta::new("/api/tasks/42").with_principal("alice");
//!     let result = gate
//!         .guard(&meta, || async { Ok::<_, std::io::Error>("done") })
//!         .await;
//!     assert_eq!(result.unwrap(), "done");
//! }
//! ```

pub mod adaptive;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod load;
pub mod prelude;
pub mod quota;

// Re-exports
pub use adaptive::DynamicConfig;
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use circuit_breaker_registry::{
    BreakerRegistry, CircuitBreakerRegistryError, DefaultBreakerRegistry, InMemoryBreakerRegistry,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{AdmissionConfig, CategoryLimits, ConfigError, RateLimitRule};
pub use endpoint::{normalize_path, EndpointCategory};
pub use error::{AdmissionError, RejectionBody};
pub use gate::{
    Admission, AdmissionGate, AdmissionGateBuilder, AdmissionLayer, AdmissionService, ClientAddr,
    GateError, Principal, RateStatus, Rejection, RequestMeta,
};
pub use limiter::{Decision, LimiterKey, WindowState, WindowedLimiter};
#[cfg(feature = "system-probe")]
pub use load::SysinfoProbe;
pub use load::{LoadMonitor, LoadProbe, LoadReading, LoadSample, SamplingError, UnavailableProbe};
pub use quota::{NoopQuotaOracle, OracleError, QuotaDecision, QuotaOracle, StaticQuotaOracle};
