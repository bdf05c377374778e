//! Circuit breaker implementation with lock-free atomics
//!
//! Two states only. `Closed` runs actions and counts consecutive failures;
//! reaching the threshold flips to `Open`. `Open` short-circuits every call
//! until something calls [`CircuitBreaker::reset`]. There is no timer-driven
//! half-open probe: recovery is signalled externally, normally by the load
//! monitor seeing load return to normal, or by an operator through the
//! registry.

use crate::clock::{duration_millis, Clock, MonotonicClock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until reset.
    Open,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        // Only the two constants are ever stored.
        if v == STATE_OPEN {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
        }
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    recovery_timeout: Duration,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Recovery timeout must be > 0.
    InvalidRecoveryTimeout(Duration),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidRecoveryTimeout(timeout) => {
                write!(f, "recovery_timeout must be > 0 (got {:?})", timeout)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(30) }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if recovery_timeout == Duration::ZERO {
            return Err(CircuitBreakerError::InvalidRecoveryTimeout(recovery_timeout));
        }
        Ok(Self { failure_threshold, recovery_timeout })
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Advertised wait while Open; surfaced to callers as their retry hint.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }
}

/// Error returned from [`CircuitBreaker::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The breaker was open; the action was not invoked.
    Open {
        /// Consecutive failures recorded when the call was rejected.
        failure_count: usize,
        /// How long the breaker has been open.
        open_for: Duration,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
    /// The action ran and failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open { failure_count, open_for, .. } => write!(
                f,
                "circuit breaker open ({} failures, open for {:?})",
                failure_count, open_for
            ),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl<E> BreakerError<E> {
    /// Whether the call was short-circuited by an open breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Whether the wrapped action was invoked.
    pub fn executed(&self) -> bool {
        !self.is_open()
    }

    /// Get the inner error if the action ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }
}

/// Named circuit breaker guarding an async operation.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and
/// affect the same lifecycle. Registries hand out clones so that every call
/// site naming the same breaker protects the same downstream resource.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker, validating threshold and timeout.
    ///
    /// # Examples
    /// ```
    /// use ninegate::CircuitBreaker;
    /// use std::time::Duration;
    /// let breaker = CircuitBreaker::new("downstream", 5, Duration::from_secs(30)).unwrap();
    /// assert_eq!(breaker.name(), "downstream");
    /// ```
    pub fn new(
        name: impl Into<Arc<str>>,
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        let config = CircuitBreakerConfig::new(failure_threshold, recovery_timeout)?;
        Ok(Self::with_config(name, config))
    }

    /// Create a breaker from an already validated config.
    pub fn with_config(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(BreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this breaker was created with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    /// Whether the breaker is open.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Clock reading at which the breaker opened, if open.
    pub fn opened_at(&self) -> Option<u64> {
        match self.state() {
            CircuitState::Open => Some(self.state.opened_at_millis.load(Ordering::Acquire)),
            CircuitState::Closed => None,
        }
    }

    /// Shared-state identity check.
    pub fn same_state(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Behavior
    /// - **Closed**: runs the operation. `Err` increments the consecutive failure count
    ///   and opens the breaker once the threshold is reached; `Ok` resets the count.
    /// - **Open**: returns [`BreakerError::Open`] without invoking the operation.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        self.execute_with(operation, |result| result.is_err()).await
    }

    /// Like [`execute`](Self::execute) but lets the caller decide what counts as a
    /// failure. The operation's result is returned as-is; `is_failure` only feeds
    /// the failure counter. Useful when an `Ok` value can still describe a
    /// downstream fault, such as an HTTP 5xx response.
    pub async fn execute_with<T, E, Fut, Op, C>(
        &self,
        operation: Op,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        if let Some(rejection) = self.rejection() {
            return Err(rejection);
        }

        let result = operation().await;

        if is_failure(&result) {
            self.on_failure();
        } else {
            self.on_success();
        }

        result.map_err(BreakerError::Inner)
    }

    /// Force the breaker open. Returns `true` if this call performed the transition.
    pub fn trip(&self) -> bool {
        let tripped = self.transition_to_open();
        if tripped {
            tracing::warn!(
                breaker = %self.name,
                failures = self.failure_count(),
                "Circuit breaker tripped → open"
            );
        }
        tripped
    }

    /// Force the breaker closed and clear the failure count.
    pub fn reset(&self) {
        self.state.failure_count.store(0, Ordering::Release);
        let prev = self.state.state.swap(CircuitState::Closed.to_u8(), Ordering::AcqRel);
        self.state.opened_at_millis.store(0, Ordering::Release);
        if prev == STATE_OPEN {
            tracing::info!(breaker = %self.name, "Circuit breaker → closed");
        }
    }

    fn rejection<E>(&self) -> Option<BreakerError<E>> {
        if self.state() == CircuitState::Closed {
            return None;
        }
        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
        let open_for = Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at));
        Some(BreakerError::Open {
            failure_count: self.failure_count(),
            open_for,
            retry_after: self.config.recovery_timeout,
        })
    }

    /// Any success in the closed state resets the counter to 0, meaning only
    /// consecutive failures trip the breaker.
    fn on_success(&self) {
        if self.state() == CircuitState::Closed {
            self.state.failure_count.store(0, Ordering::Release);
        }
    }

    fn on_failure(&self) {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold && self.transition_to_open() {
            tracing::error!(
                breaker = %self.name,
                failures,
                threshold = self.config.failure_threshold,
                "Circuit breaker → open"
            );
        }
    }

    /// Only the caller that wins the Closed → Open exchange stamps `opened_at`.
    fn transition_to_open(&self) -> bool {
        let won = self
            .state
            .state
            .compare_exchange(
                CircuitState::Closed.to_u8(),
                CircuitState::Open.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
        }
        won
    }
}

/// Recovery timeout in whole seconds, rounded up, for `Retry-After` headers.
pub(crate) fn retry_after_secs(d: Duration) -> u64 {
    duration_millis(d).div_ceil(1000).max(1)
}
