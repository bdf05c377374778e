//! Admission configuration.
//!
//! All values are operator-tunable. The struct deserializes from JSON (or any
//! serde format) with every field optional; missing fields take the defaults
//! below. [`AdmissionConfig::validate`] runs on every path that installs a
//! config into a gate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::endpoint::EndpointCategory;

/// Name of the system-wide high-load breaker unless configured otherwise.
pub const DEFAULT_BREAKER_NAME: &str = "system-high-load";

/// A request budget: `limit` requests per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests admitted per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitRule {
    /// Build a rule.
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// Window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// A zero-length window would reset on every acquisition.
    pub fn is_valid(&self) -> bool {
        self.window_secs > 0
    }
}

/// Static per-category defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryLimits {
    /// Login, registration, token refresh.
    pub authentication: RateLimitRule,
    /// Task item endpoints.
    pub task_items: RateLimitRule,
    /// Everything else.
    pub general: RateLimitRule,
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            authentication: RateLimitRule::new(5, 60),
            task_items: RateLimitRule::new(30, 30),
            general: RateLimitRule::new(60, 60),
        }
    }
}

impl CategoryLimits {
    /// Rule for `category`.
    pub fn for_category(&self, category: EndpointCategory) -> RateLimitRule {
        match category {
            EndpointCategory::Authentication => self.authentication,
            EndpointCategory::TaskItems => self.task_items,
            EndpointCategory::General => self.general,
        }
    }
}

/// Errors from config validation or parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A percentage was outside its allowed range.
    #[error("{field} must be within {min}..={max} (got {value})")]
    OutOfRange {
        /// Offending field.
        field: &'static str,
        /// Provided value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// A duration or window was zero.
    #[error("{0} must be > 0")]
    Zero(&'static str),
    /// The breaker name was empty.
    #[error("breaker_name must not be empty")]
    EmptyBreakerName,
    /// Breaker settings were rejected.
    #[error("invalid breaker settings: {0}")]
    Breaker(#[from] CircuitBreakerError),
    /// The document could not be parsed.
    #[error("invalid admission config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for the whole admission layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Minimum spacing between load samples.
    pub load_check_interval_secs: u64,
    /// CPU or memory percentage above which the system counts as high load.
    pub high_load_threshold_percent: f64,
    /// CPU or memory percentage above which the load monitor trips the breaker.
    pub extreme_load_threshold_percent: f64,
    /// Percentage removed from every limit under high load.
    pub high_load_reduction_percent: u32,
    /// Floor for a reduced limit.
    pub min_limit: u32,
    /// Registry name of the system-wide high-load breaker.
    pub breaker_name: String,
    /// Consecutive downstream failures that open the breaker.
    pub breaker_failure_threshold: usize,
    /// Retry hint given while the breaker is open.
    pub breaker_recovery_secs: u64,
    /// Retry hint for the high-load short-circuit.
    pub high_load_retry_after_secs: u64,
    /// Whether 5xx responses from downstream count as breaker failures.
    pub count_server_errors: bool,
    /// Idle limiter keys are evicted after this many windows.
    pub eviction_factor: u32,
    /// Static limits per endpoint category.
    pub limits: CategoryLimits,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            load_check_interval_secs: 30,
            high_load_threshold_percent: 80.0,
            extreme_load_threshold_percent: 95.0,
            high_load_reduction_percent: 50,
            min_limit: 5,
            breaker_name: DEFAULT_BREAKER_NAME.to_string(),
            breaker_failure_threshold: 5,
            breaker_recovery_secs: 30,
            high_load_retry_after_secs: 30,
            count_server_errors: true,
            eviction_factor: crate::limiter::DEFAULT_EVICTION_FACTOR,
            limits: CategoryLimits::default(),
        }
    }
}

impl AdmissionConfig {
    /// Parse and validate a JSON document.
    ///
    /// ```
    /// use ninegate::AdmissionConfig;
    /// let cfg = AdmissionConfig::from_json_str(r#"{ "min_limit": 2 }"#).unwrap();
    /// assert_eq!(cfg.min_limit, 2);
    /// assert_eq!(cfg.high_load_reduction_percent, 50);
    /// ```
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check ranges and non-zero durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_check_interval_secs == 0 {
            return Err(ConfigError::Zero("load_check_interval_secs"));
        }
        check_percent("high_load_threshold_percent", self.high_load_threshold_percent)?;
        check_percent("extreme_load_threshold_percent", self.extreme_load_threshold_percent)?;
        check_percent("high_load_reduction_percent", f64::from(self.high_load_reduction_percent))?;
        if self.breaker_name.trim().is_empty() {
            return Err(ConfigError::EmptyBreakerName);
        }
        CircuitBreakerConfig::new(self.breaker_failure_threshold, self.breaker_recovery_timeout())?;
        if self.high_load_retry_after_secs == 0 {
            return Err(ConfigError::Zero("high_load_retry_after_secs"));
        }
        for (name, rule) in [
            ("limits.authentication.window_secs", self.limits.authentication),
            ("limits.task_items.window_secs", self.limits.task_items),
            ("limits.general.window_secs", self.limits.general),
        ] {
            if !rule.is_valid() {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    /// Set the high-load threshold.
    pub fn with_high_load_threshold(mut self, percent: f64) -> Self {
        self.high_load_threshold_percent = percent;
        self
    }

    /// Set the limit reduction applied under high load.
    pub fn with_reduction(mut self, percent: u32, min_limit: u32) -> Self {
        self.high_load_reduction_percent = percent;
        self.min_limit = min_limit;
        self
    }

    /// Set breaker name and thresholds.
    pub fn with_breaker(mut self, name: impl Into<String>, threshold: usize, recovery: Duration) -> Self {
        self.breaker_name = name.into();
        self.breaker_failure_threshold = threshold;
        self.breaker_recovery_secs = recovery.as_secs();
        self
    }

    /// Set the static limits.
    pub fn with_limits(mut self, limits: CategoryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Spacing between load samples.
    pub fn load_check_interval(&self) -> Duration {
        Duration::from_secs(self.load_check_interval_secs)
    }

    /// Breaker recovery timeout.
    pub fn breaker_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_recovery_secs)
    }

    /// Retry hint for the high-load short-circuit.
    pub fn high_load_retry_after(&self) -> Duration {
        Duration::from_secs(self.high_load_retry_after_secs)
    }

    /// Breaker settings. Falls back to the breaker defaults if the fields were
    /// mutated into an invalid state after validation.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(self.breaker_failure_threshold, self.breaker_recovery_timeout())
            .unwrap_or_default()
    }

    /// Limit to enforce given the base rule limit and the current load.
    ///
    /// Under high load the limit loses `high_load_reduction_percent` and is
    /// floored at `min_limit`, but never raised above `base`.
    pub fn effective_limit(&self, base: u32, high_load: bool) -> u32 {
        if !high_load {
            return base;
        }
        let keep = 100u64.saturating_sub(u64::from(self.high_load_reduction_percent));
        let reduced = u32::try_from(u64::from(base) * keep / 100).unwrap_or(base);
        reduced.max(self.min_limit).min(base)
    }
}

fn check_percent(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::OutOfRange { field, value, min: 0.0, max: 100.0 });
    }
    Ok(())
}
