//! Subscription / quota oracle interface.
//!
//! The gate consults an oracle for daily quotas, trusted accounts, per-user
//! rate rules, and usage tracking. Only the interface lives here; real
//! deployments back it with their subscription store.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

use crate::config::RateLimitRule;

/// Daily quota state for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    /// Whether the daily quota is used up.
    pub exceeded: bool,
    /// Requests left today.
    pub remaining: u64,
    /// When the quota resets.
    pub reset_at: SystemTime,
}

impl QuotaDecision {
    /// Unlimited quota, for principals without a plan.
    pub fn unlimited() -> Self {
        Self { exceeded: false, remaining: u64::MAX, reset_at: next_utc_midnight() }
    }
}

/// Errors from oracle lookups or usage tracking.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    /// The backing store could not be reached.
    #[error("quota backend unavailable: {0}")]
    Unavailable(String),
}

/// Source of quota, trust, and per-user rate information.
#[async_trait]
pub trait QuotaOracle: Send + Sync + std::fmt::Debug {
    /// Daily quota state for `principal`.
    async fn daily_quota(&self, principal: &str) -> Result<QuotaDecision, OracleError>;

    /// Whether `principal` bypasses rate limiting and breaker blocking.
    async fn is_trusted(&self, principal: &str) -> Result<bool, OracleError>;

    /// Per-user rule for `endpoint`, or `None` to fall back to static defaults.
    async fn rate_limit(
        &self,
        principal: &str,
        endpoint: &str,
    ) -> Result<Option<RateLimitRule>, OracleError>;

    /// Count one admitted request against the principal's usage.
    async fn record_usage(&self, principal: &str, endpoint: &str) -> Result<(), OracleError>;
}

/// Oracle with no quotas, no trusted accounts, and no per-user rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQuotaOracle;

#[async_trait]
impl QuotaOracle for NoopQuotaOracle {
    async fn daily_quota(&self, _principal: &str) -> Result<QuotaDecision, OracleError> {
        Ok(QuotaDecision::unlimited())
    }

    async fn is_trusted(&self, _principal: &str) -> Result<bool, OracleError> {
        Ok(false)
    }

    async fn rate_limit(
        &self,
        _principal: &str,
        _endpoint: &str,
    ) -> Result<Option<RateLimitRule>, OracleError> {
        Ok(None)
    }

    async fn record_usage(&self, _principal: &str, _endpoint: &str) -> Result<(), OracleError> {
        Ok(())
    }
}

/// In-memory oracle for tests and single-node deployments.
///
/// Usage counters are kept per principal and never roll over on their own;
/// call [`StaticQuotaOracle::reset_usage`] from a daily job.
#[derive(Debug, Default)]
pub struct StaticQuotaOracle {
    daily_limits: DashMap<String, u64>,
    usage: DashMap<String, u64>,
    trusted: DashSet<String>,
    overrides: DashMap<(String, String), RateLimitRule>,
    reset_at: Option<SystemTime>,
}

impl StaticQuotaOracle {
    /// Empty oracle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap `principal` at `limit` requests per day.
    pub fn with_daily_quota(self, principal: impl Into<String>, limit: u64) -> Self {
        self.daily_limits.insert(principal.into(), limit);
        self
    }

    /// Mark `principal` as trusted.
    pub fn with_trusted(self, principal: impl Into<String>) -> Self {
        self.trusted.insert(principal.into());
        self
    }

    /// Per-user rule for one endpoint.
    pub fn with_rule(
        self,
        principal: impl Into<String>,
        endpoint: impl Into<String>,
        rule: RateLimitRule,
    ) -> Self {
        self.overrides.insert((principal.into(), endpoint.into()), rule);
        self
    }

    /// Pin the quota reset instant instead of the next UTC midnight.
    pub fn with_reset_at(mut self, at: SystemTime) -> Self {
        self.reset_at = Some(at);
        self
    }

    /// Pre-load usage for `principal`.
    pub fn set_usage(&self, principal: impl Into<String>, used: u64) {
        self.usage.insert(principal.into(), used);
    }

    /// Requests recorded for `principal`.
    pub fn usage(&self, principal: &str) -> u64 {
        self.usage.get(principal).map(|u| *u).unwrap_or(0)
    }

    /// Clear all usage counters.
    pub fn reset_usage(&self) {
        self.usage.clear();
    }
}

#[async_trait]
impl QuotaOracle for StaticQuotaOracle {
    async fn daily_quota(&self, principal: &str) -> Result<QuotaDecision, OracleError> {
        let reset_at = self.reset_at.unwrap_or_else(next_utc_midnight);
        let Some(limit) = self.daily_limits.get(principal).map(|l| *l) else {
            return Ok(QuotaDecision { reset_at, ..QuotaDecision::unlimited() });
        };
        let used = self.usage(principal);
        Ok(QuotaDecision {
            exceeded: used >= limit,
            remaining: limit.saturating_sub(used),
            reset_at,
        })
    }

    async fn is_trusted(&self, principal: &str) -> Result<bool, OracleError> {
        Ok(self.trusted.contains(principal))
    }

    async fn rate_limit(
        &self,
        principal: &str,
        endpoint: &str,
    ) -> Result<Option<RateLimitRule>, OracleError> {
        Ok(self.overrides.get(&(principal.to_string(), endpoint.to_string())).map(|r| *r))
    }

    async fn record_usage(&self, principal: &str, _endpoint: &str) -> Result<(), OracleError> {
        *self.usage.entry(principal.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// Start of the next UTC day.
pub fn next_utc_midnight() -> SystemTime {
    let now = Utc::now();
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| SystemTime::from(midnight.and_utc()))
        .unwrap_or_else(|| SystemTime::from(now) + Duration::from_secs(86_400))
}

/// RFC 3339 rendering used in rejection bodies.
pub(crate) fn format_instant(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
