//! Admission orchestration.
//!
//! [`AdmissionGate`] decides, per request and in this order:
//!
//! 1. daily quota (principal only) → 429 with the quota reset time,
//! 2. trust bypass → exempt from limiting and load shedding,
//! 3. windowed rate limit on `(principal or client address, endpoint)`,
//!    with the limit cut down while the system is under high load → 429,
//! 4. load shedding: high load and the system breaker open → 503,
//! 5. the downstream action itself, through the system breaker → 503 when
//!    the breaker short-circuits.
//!
//! Oracle lookups and usage tracking that fail are logged and never change
//! the outcome. The transport-agnostic core lives here; [`http`] wraps it as
//! tower middleware.

pub mod http;

pub use self::http::{AdmissionLayer, AdmissionService, ClientAddr, Principal};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::adaptive::DynamicConfig;
use crate::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::circuit_breaker_registry::{BreakerRegistry, InMemoryBreakerRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionConfig, ConfigError};
use crate::endpoint::{normalize_path, EndpointCategory};
use crate::error::AdmissionError;
use crate::limiter::{Decision, LimiterKey, WindowedLimiter};
use crate::load::{LoadMonitor, LoadProbe};
use crate::quota::{NoopQuotaOracle, QuotaOracle};

/// Principal used for callers with neither identity nor address.
pub const ANONYMOUS_PRINCIPAL: &str = "anonymous";

/// What the gate needs to know about a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Authenticated user id, if any.
    pub principal: Option<String>,
    /// Client network address, if known.
    pub client_addr: Option<String>,
    /// Raw request path; normalized by the gate.
    pub path: String,
}

impl RequestMeta {
    /// Anonymous request for `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Attach an authenticated principal.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Attach the client address.
    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = Some(addr.into());
        self
    }
}

/// Rate-limit metadata reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStatus {
    /// The request was counted against a window.
    Limited {
        /// Limit in force (after any load reduction).
        limit: u32,
        /// Permits left in the window.
        remaining: u32,
        /// Window reset as unix seconds.
        reset_epoch_secs: u64,
    },
    /// Trusted principal; no window consulted.
    Exempt,
}

/// A refused request: the reason plus whatever rate metadata was computed
/// before the refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Why the request was refused.
    pub error: AdmissionError,
    /// Rate metadata, when the limiter was consulted.
    pub rate: Option<RateStatus>,
    /// Load classification at decision time.
    pub high_load: bool,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for Rejection {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Error from [`AdmissionGate::guard`] and [`Admission::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError<E> {
    /// The gate refused the request.
    Rejected(Rejection),
    /// The downstream action ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Rejected(r) => write!(f, "{}", r),
            GateError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GateError::Rejected(r) => Some(r),
            GateError::Inner(e) => Some(e),
        }
    }
}

impl<E> GateError<E> {
    /// The rejection, if the gate refused the request.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            GateError::Rejected(r) => Some(r),
            GateError::Inner(_) => None,
        }
    }

    /// Whether the downstream action was invoked.
    pub fn executed(&self) -> bool {
        matches!(self, GateError::Inner(_))
    }
}

/// Permission to run the downstream action, returned by [`AdmissionGate::admit`].
#[derive(Debug, Clone)]
pub struct Admission {
    rate: RateStatus,
    high_load: bool,
    trusted: bool,
    endpoint: String,
    breaker: CircuitBreaker,
    count_server_errors: bool,
}

impl Admission {
    /// Rate metadata for response headers.
    pub fn rate(&self) -> &RateStatus {
        &self.rate
    }

    /// Load classification at decision time.
    pub fn high_load(&self) -> bool {
        self.high_load
    }

    /// Whether the principal is trusted.
    pub fn trusted(&self) -> bool {
        self.trusted
    }

    /// Normalized endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Breaker the action runs under.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Whether 5xx responses count as breaker failures.
    pub fn count_server_errors(&self) -> bool {
        self.count_server_errors
    }

    /// Run the action through the system breaker; `Err` counts as a failure.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, GateError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        self.execute_with(operation, |result| result.is_err()).await
    }

    /// Run the action through the system breaker with a custom failure test.
    ///
    /// Trusted principals are never blocked by the breaker: their action runs
    /// directly and its outcome is not recorded.
    pub async fn execute_with<T, E, Fut, Op, C>(
        &self,
        operation: Op,
        is_failure: C,
    ) -> Result<T, GateError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        if self.trusted {
            return operation().await.map_err(GateError::Inner);
        }
        match self.breaker.execute_with(operation, is_failure).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Inner(e)) => Err(GateError::Inner(e)),
            Err(BreakerError::Open { retry_after, failure_count, .. }) => {
                warn!(
                    breaker = self.breaker.name(),
                    endpoint = %self.endpoint,
                    failure_count,
                    "downstream short-circuited by open breaker"
                );
                Err(GateError::Rejected(Rejection {
                    error: AdmissionError::CircuitOpen {
                        breaker: self.breaker.name().to_string(),
                        retry_after,
                        load_shed: false,
                    },
                    rate: Some(self.rate),
                    high_load: self.high_load,
                }))
            }
        }
    }
}

/// The admission-control service.
///
/// Clones share limiter windows, breakers, load state, and configuration.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    limiter: WindowedLimiter,
    registry: Arc<dyn BreakerRegistry>,
    monitor: Arc<LoadMonitor>,
    oracle: Arc<dyn QuotaOracle>,
    config: DynamicConfig<AdmissionConfig>,
    clock: Arc<dyn Clock>,
}

impl AdmissionGate {
    /// Start building a gate.
    pub fn builder() -> AdmissionGateBuilder {
        AdmissionGateBuilder::default()
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<AdmissionConfig> {
        self.config.get()
    }

    /// Validate and install a new configuration. Limiter windows and breakers
    /// already created keep their state.
    pub fn update_config(&self, config: AdmissionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.set(config);
        info!("admission config updated");
        Ok(())
    }

    /// The window limiter.
    pub fn limiter(&self) -> &WindowedLimiter {
        &self.limiter
    }

    /// The breaker registry.
    pub fn registry(&self) -> &Arc<dyn BreakerRegistry> {
        &self.registry
    }

    /// The load monitor.
    pub fn monitor(&self) -> &Arc<LoadMonitor> {
        &self.monitor
    }

    /// The system-wide high-load breaker, created on first use.
    pub fn system_breaker(&self) -> CircuitBreaker {
        let config = self.config.get();
        self.registry.get_or_create(&config.breaker_name, &config.breaker_config())
    }

    /// Start the load-sampling ticker and the idle-window janitor.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let interval = self.config.get().load_check_interval();
        vec![self.monitor.clone().spawn(), self.limiter.spawn_janitor(interval)]
    }

    /// Decide whether a request may proceed.
    pub async fn admit(&self, meta: &RequestMeta) -> Result<Admission, Rejection> {
        let config = self.config.get();
        let endpoint = normalize_path(&meta.path);
        let high_load = self.monitor.is_high_load();
        let principal = meta.principal.as_deref().filter(|p| !p.is_empty());

        if let Some(principal) = principal {
            match self.oracle.daily_quota(principal).await {
                Ok(quota) if quota.exceeded => {
                    info!(principal, endpoint = %endpoint, "daily quota exceeded");
                    let retry_after =
                        quota.reset_at.duration_since(self.wall_now()).unwrap_or(Duration::ZERO);
                    return Err(Rejection {
                        error: AdmissionError::QuotaExceeded {
                            retry_after,
                            reset_at: quota.reset_at,
                        },
                        rate: None,
                        high_load,
                    });
                }
                Ok(_) => {}
                Err(err) => warn!(principal, error = %err, "quota lookup failed; admitting"),
            }
        }

        let trusted = match principal {
            Some(principal) => self.oracle.is_trusted(principal).await.unwrap_or_else(|err| {
                warn!(principal, error = %err, "trust lookup failed; treating as untrusted");
                false
            }),
            None => false,
        };

        let rate = if trusted {
            debug!(endpoint = %endpoint, "trusted principal; rate limit exempt");
            RateStatus::Exempt
        } else {
            self.acquire(&config, meta, principal, &endpoint, high_load).await?
        };

        let breaker = self.registry.get_or_create(&config.breaker_name, &config.breaker_config());
        if high_load && !trusted && breaker.is_open() {
            warn!(breaker = breaker.name(), endpoint = %endpoint, "shedding request under high load");
            return Err(Rejection {
                error: AdmissionError::CircuitOpen {
                    breaker: breaker.name().to_string(),
                    retry_after: config.high_load_retry_after(),
                    load_shed: true,
                },
                rate: Some(rate),
                high_load,
            });
        }

        Ok(Admission {
            rate,
            high_load,
            trusted,
            endpoint,
            breaker,
            count_server_errors: config.count_server_errors,
        })
    }

    /// [`admit`](Self::admit) then run `operation` through the system breaker.
    pub async fn guard<T, E, Fut, Op>(
        &self,
        meta: &RequestMeta,
        operation: Op,
    ) -> Result<T, GateError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let admission = self.admit(meta).await.map_err(GateError::Rejected)?;
        admission.execute(operation).await
    }

    async fn acquire(
        &self,
        config: &AdmissionConfig,
        meta: &RequestMeta,
        principal: Option<&str>,
        endpoint: &str,
        high_load: bool,
    ) -> Result<RateStatus, Rejection> {
        let user_rule = match principal {
            Some(principal) => match self.oracle.rate_limit(principal, endpoint).await {
                Ok(Some(rule)) if !rule.is_valid() => {
                    warn!(principal, endpoint, ?rule, "invalid rate rule from oracle; using defaults");
                    None
                }
                Ok(rule) => rule,
                Err(err) => {
                    warn!(principal, endpoint, error = %err, "rate rule lookup failed; using defaults");
                    None
                }
            },
            None => None,
        };
        let rule = user_rule
            .unwrap_or_else(|| config.limits.for_category(EndpointCategory::classify(endpoint)));
        let limit = config.effective_limit(rule.limit, high_load);

        let key = match (principal, meta.client_addr.as_deref()) {
            (Some(principal), _) => LimiterKey::user(principal, endpoint),
            (None, Some(addr)) => LimiterKey::client(addr, endpoint),
            (None, None) => LimiterKey::client(ANONYMOUS_PRINCIPAL, endpoint),
        };
        let decision = self.limiter.try_acquire(&key, limit, rule.window());
        let status = RateStatus::Limited {
            limit: decision.limit(),
            remaining: decision.remaining(),
            reset_epoch_secs: decision.reset_at().div_ceil(1000),
        };

        match decision {
            Decision::Acquired { .. } => {
                if let Some(principal) = principal {
                    self.track_usage(principal, endpoint);
                }
                Ok(status)
            }
            Decision::Rejected { retry_after, .. } => {
                info!(key = %key, limit, high_load, "rate limit exceeded");
                Err(Rejection {
                    error: AdmissionError::RateLimited { limit, retry_after },
                    rate: Some(status),
                    high_load,
                })
            }
        }
    }

    /// Usage tracking runs detached so it can neither fail nor delay the request.
    fn track_usage(&self, principal: &str, endpoint: &str) {
        let oracle = self.oracle.clone();
        let principal = principal.to_string();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(err) = oracle.record_usage(&principal, &endpoint).await {
                warn!(principal = %principal, endpoint = %endpoint, error = %err, "usage tracking failed");
            }
        });
    }

    fn wall_now(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.clock.now_millis())
    }
}

/// Builder for [`AdmissionGate`].
#[derive(Debug, Default)]
pub struct AdmissionGateBuilder {
    config: AdmissionConfig,
    oracle: Option<Arc<dyn QuotaOracle>>,
    probe: Option<Arc<dyn LoadProbe>>,
    registry: Option<Arc<dyn BreakerRegistry>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AdmissionGateBuilder {
    /// Configuration; validated by [`build`](Self::build).
    pub fn config(mut self, config: AdmissionConfig) -> Self {
        self.config = config;
        self
    }

    /// Quota oracle. Defaults to [`NoopQuotaOracle`].
    pub fn oracle<O: QuotaOracle + 'static>(self, oracle: O) -> Self {
        self.shared_oracle(Arc::new(oracle))
    }

    /// Quota oracle the caller keeps a handle to.
    pub fn shared_oracle(mut self, oracle: Arc<dyn QuotaOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Load probe. Defaults to the host probe when the `system-probe` feature
    /// is enabled, otherwise to a probe that always reports normal load.
    pub fn probe<P: LoadProbe + 'static>(self, probe: P) -> Self {
        self.shared_probe(Arc::new(probe))
    }

    /// Load probe the caller keeps a handle to.
    pub fn shared_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Breaker registry shared with other components.
    pub fn registry(mut self, registry: Arc<dyn BreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Clock for windows, breakers, and load sampling. Must count from the
    /// unix epoch for `X-RateLimit-Reset` to be meaningful.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Validate the configuration and assemble the gate.
    pub fn build(self) -> Result<AdmissionGate, ConfigError> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(InMemoryBreakerRegistry::new().with_shared_clock(clock.clone()))
        });
        let probe = self.probe.unwrap_or_else(default_probe);
        let oracle = self.oracle.unwrap_or_else(|| Arc::new(NoopQuotaOracle));
        let limiter = WindowedLimiter::new()
            .with_shared_clock(clock.clone())
            .with_eviction_factor(self.config.eviction_factor);
        let config = DynamicConfig::new(self.config);
        let monitor = Arc::new(
            LoadMonitor::new(probe, registry.clone(), config.clone())
                .with_shared_clock(clock.clone()),
        );

        Ok(AdmissionGate { limiter, registry, monitor, oracle, config, clock })
    }
}

#[cfg(feature = "system-probe")]
fn default_probe() -> Arc<dyn LoadProbe> {
    Arc::new(crate::load::SysinfoProbe::new())
}

#[cfg(not(feature = "system-probe"))]
fn default_probe() -> Arc<dyn LoadProbe> {
    Arc::new(crate::load::UnavailableProbe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::config::RateLimitRule;
    use crate::load::{LoadReading, SamplingError};
    use crate::quota::StaticQuotaOracle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FixedProbe(Mutex<(f64, f64)>);

    impl FixedProbe {
        fn set(&self, cpu: f64, memory: f64) {
            *self.0.lock().unwrap() = (cpu, memory);
        }
    }

    impl LoadProbe for FixedProbe {
        fn read(&self) -> Result<LoadReading, SamplingError> {
            let (cpu_percent, memory_percent) = *self.0.lock().unwrap();
            Ok(LoadReading { cpu_percent, memory_percent })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError")
        }
    }

    impl std::error::Error for TestError {}

    const T0: u64 = 1_700_000_000_000;

    fn gate_with(
        oracle: StaticQuotaOracle,
        config: AdmissionConfig,
    ) -> (AdmissionGate, Arc<FixedProbe>, ManualClock) {
        let probe = Arc::new(FixedProbe::default());
        let clock = ManualClock::new(T0);
        let gate = AdmissionGate::builder()
            .config(config)
            .oracle(oracle)
            .shared_probe(probe.clone())
            .clock(clock.clone())
            .build()
            .expect("valid gate");
        (gate, probe, clock)
    }

    fn enter_high_load(gate: &AdmissionGate, probe: &FixedProbe, clock: &ManualClock, cpu: f64) {
        probe.set(cpu, 10.0);
        clock.advance(gate.config().load_check_interval());
        assert!(gate.monitor().sample().is_high_load);
    }

    #[tokio::test]
    async fn anonymous_requests_keyed_by_client_address() {
        let (gate, _, _) = gate_with(StaticQuotaOracle::new(), AdmissionConfig::default());
        let a = RequestMeta::new("/auth/login").with_client_addr("10.0.0.1");
        let b = RequestMeta::new("/auth/login").with_client_addr("10.0.0.2");

        for _ in 0..5 {
            gate.admit(&a).await.expect("within auth default");
        }
        let rejected = gate.admit(&a).await.expect_err("auth default is 5");
        assert!(rejected.error.is_rate_limited());
        assert!(gate.admit(&b).await.is_ok(), "other address has its own window");
        assert!(gate.limiter().peek(&LimiterKey::client("10.0.0.1", "/auth/login")).is_some());
    }

    #[tokio::test]
    async fn principal_and_address_windows_are_separate() {
        let (gate, _, _) = gate_with(StaticQuotaOracle::new(), AdmissionConfig::default());
        let anonymous = RequestMeta::new("/auth/login").with_client_addr("10.0.0.1");
        let user = RequestMeta::new("/auth/login").with_principal("10.0.0.1");

        for _ in 0..5 {
            gate.admit(&anonymous).await.unwrap();
        }
        assert!(gate.admit(&anonymous).await.is_err());
        assert!(gate.admit(&user).await.is_ok(), "user id shaped like an address has its own window");
        assert_eq!(gate.limiter().len(), 2);
    }

    #[tokio::test]
    async fn zero_window_rule_falls_back_to_category_default() {
        let oracle = StaticQuotaOracle::new().with_rule("u1", "/api/x", RateLimitRule::new(1, 0));
        let (gate, _, _) = gate_with(oracle, AdmissionConfig::default());
        let meta = RequestMeta::new("/api/x").with_principal("u1");

        let first = gate.admit(&meta).await.unwrap();
        assert!(matches!(first.rate(), RateStatus::Limited { limit: 60, remaining: 59, .. }));
        for _ in 0..59 {
            gate.admit(&meta).await.unwrap();
        }
        assert!(gate.admit(&meta).await.unwrap_err().error.is_rate_limited());
    }

    #[tokio::test]
    async fn per_user_rule_overrides_category_default() {
        let oracle =
            StaticQuotaOracle::new().with_rule("u1", "/auth/login", RateLimitRule::new(7, 60));
        let (gate, _, _) = gate_with(oracle, AdmissionConfig::default());
        let meta = RequestMeta::new("/auth/login").with_principal("u1");
        let admission = gate.admit(&meta).await.unwrap();
        assert!(matches!(admission.rate(), RateStatus::Limited { limit: 7, remaining: 6, .. }));
    }

    #[tokio::test]
    async fn high_load_halves_limit() {
        let oracle =
            StaticQuotaOracle::new().with_rule("u1", "/api/reports", RateLimitRule::new(100, 60));
        let (gate, probe, clock) = gate_with(oracle, AdmissionConfig::default());
        let meta = RequestMeta::new("/api/reports").with_principal("u1");

        let normal = gate.admit(&meta).await.unwrap();
        assert!(matches!(normal.rate(), RateStatus::Limited { limit: 100, .. }));

        enter_high_load(&gate, &probe, &clock, 85.0);
        let reduced = gate.admit(&meta).await.unwrap();
        assert!(reduced.high_load());
        assert!(matches!(reduced.rate(), RateStatus::Limited { limit: 50, .. }));
    }

    #[tokio::test]
    async fn reset_header_is_unix_seconds_of_window_end() {
        let (gate, _, _) = gate_with(StaticQuotaOracle::new(), AdmissionConfig::default());
        let admission = gate.admit(&RequestMeta::new("/api/other")).await.unwrap();
        let expected = (T0 + 60_000) / 1000;
        assert!(matches!(
            admission.rate(),
            RateStatus::Limited { reset_epoch_secs, .. } if *reset_epoch_secs == expected
        ));
    }

    #[tokio::test]
    async fn quota_exceeded_reports_time_to_reset() {
        let reset_at = SystemTime::UNIX_EPOCH + Duration::from_millis(T0 + 90_000);
        let oracle = StaticQuotaOracle::new().with_daily_quota("u1", 0).with_reset_at(reset_at);
        let (gate, _, _) = gate_with(oracle, AdmissionConfig::default());

        let rejection =
            gate.admit(&RequestMeta::new("/api/tasks").with_principal("u1")).await.unwrap_err();
        assert_eq!(
            rejection.error,
            AdmissionError::QuotaExceeded { retry_after: Duration::from_secs(90), reset_at }
        );
        assert!(rejection.rate.is_none(), "limiter not consulted");
        assert!(gate.limiter().is_empty());
    }

    #[tokio::test]
    async fn trusted_principal_skips_limiter() {
        let oracle = StaticQuotaOracle::new().with_trusted("admin");
        let (gate, _, _) = gate_with(oracle, AdmissionConfig::default());
        let meta = RequestMeta::new("/auth/login").with_principal("admin");
        for _ in 0..20 {
            let admission = gate.admit(&meta).await.unwrap();
            assert_eq!(admission.rate(), &RateStatus::Exempt);
            assert!(admission.trusted());
        }
        assert!(gate.limiter().is_empty());
    }

    #[tokio::test]
    async fn sheds_untrusted_when_high_load_and_breaker_open() {
        let oracle = StaticQuotaOracle::new().with_trusted("admin");
        let (gate, probe, clock) = gate_with(oracle, AdmissionConfig::default());
        enter_high_load(&gate, &probe, &clock, 97.0);
        assert_eq!(gate.system_breaker().state(), CircuitState::Open);

        let rejection = gate.admit(&RequestMeta::new("/api/x").with_principal("u1")).await.unwrap_err();
        assert!(matches!(
            rejection.error,
            AdmissionError::CircuitOpen { load_shed: true, retry_after, .. } if retry_after == Duration::from_secs(30)
        ));
        assert!(rejection.rate.is_some(), "rate headers still computed");

        let trusted = gate.admit(&RequestMeta::new("/api/x").with_principal("admin")).await.unwrap();
        assert!(trusted.trusted());
    }

    #[tokio::test]
    async fn open_breaker_under_normal_load_short_circuits_action() {
        let config = AdmissionConfig::default().with_breaker("sys", 3, Duration::from_secs(45));
        let (gate, _, _) = gate_with(StaticQuotaOracle::new(), config);
        let meta = RequestMeta::new("/api/x");

        for _ in 0..3 {
            let err = gate.guard(&meta, || async { Err::<(), _>(TestError) }).await.unwrap_err();
            assert!(err.executed());
        }

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let err = gate
            .guard(&meta, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await
            .unwrap_err();
        assert!(!err.executed());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        let rejection = err.rejection().unwrap();
        assert_eq!(rejection.error.retry_after(), Duration::from_secs(45));
        assert_eq!(rejection.error.status_code(), ::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn trusted_action_runs_while_breaker_open() {
        let oracle = StaticQuotaOracle::new().with_trusted("admin");
        let (gate, _, _) = gate_with(oracle, AdmissionConfig::default());
        gate.system_breaker().trip();

        let meta = RequestMeta::new("/api/x").with_principal("admin");
        let out = gate.guard(&meta, || async { Ok::<_, TestError>(7) }).await;
        assert_eq!(out, Ok(7));

        let err = gate
            .guard(&RequestMeta::new("/api/x"), || async { Ok::<_, TestError>(7) })
            .await
            .unwrap_err();
        assert!(!err.executed());
    }

    #[tokio::test]
    async fn usage_is_tracked_for_admitted_principals() {
        let oracle = Arc::new(StaticQuotaOracle::new());
        let probe = Arc::new(FixedProbe::default());
        let gate = AdmissionGate::builder()
            .shared_oracle(oracle.clone())
            .shared_probe(probe)
            .build()
            .unwrap();

        gate.admit(&RequestMeta::new("/api/x").with_principal("u1")).await.unwrap();
        for _ in 0..100 {
            if oracle.usage("u1") == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(oracle.usage("u1"), 1);
    }

    #[tokio::test]
    async fn update_config_validates_and_applies() {
        let (gate, _, _) = gate_with(StaticQuotaOracle::new(), AdmissionConfig::default());
        assert!(gate
            .update_config(AdmissionConfig::default().with_high_load_threshold(-1.0))
            .is_err());

        let mut limits = crate::config::CategoryLimits::default();
        limits.general = RateLimitRule::new(1, 60);
        gate.update_config(AdmissionConfig::default().with_limits(limits)).unwrap();
        let meta = RequestMeta::new("/api/x");
        gate.admit(&meta).await.unwrap();
        assert!(gate.admit(&meta).await.unwrap_err().error.is_rate_limited());
    }
}
