//! Request-fatal admission errors.
//!
//! Only three outcomes end a request in this layer: a spent daily quota, an
//! exhausted rate window, and an open breaker. Everything else (usage
//! tracking, oracle lookups, load sampling) is logged and swallowed where it
//! happens; see [`OracleError`](crate::quota::OracleError) and
//! [`SamplingError`](crate::load::SamplingError).
use std::fmt;
use std::time::{Duration, SystemTime};

use http::StatusCode;
use serde::Serialize;

use crate::circuit_breaker::retry_after_secs;
use crate::quota::format_instant;

/// Reasons a request is refused admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The principal's daily quota is used up.
    QuotaExceeded {
        /// Time until the quota resets.
        retry_after: Duration,
        /// Instant the quota resets.
        reset_at: SystemTime,
    },
    /// The key's rate window is exhausted.
    RateLimited {
        /// Limit in force when the request was refused.
        limit: u32,
        /// Time left in the current window.
        retry_after: Duration,
    },
    /// The downstream breaker is open.
    CircuitOpen {
        /// Name of the open breaker.
        breaker: String,
        /// Suggested wait before retrying.
        retry_after: Duration,
        /// Refused by the high-load short-circuit rather than by the breaker
        /// around the action.
        load_shed: bool,
    },
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExceeded { reset_at, .. } => {
                write!(f, "daily quota exceeded; resets at {}", format_instant(*reset_at))
            }
            Self::RateLimited { limit, retry_after } => write!(
                f,
                "rate limit of {} requests exceeded; retry after {} seconds",
                limit,
                retry_after_secs(*retry_after)
            ),
            Self::CircuitOpen { load_shed: true, .. } => {
                write!(f, "service temporarily unavailable due to high system load")
            }
            Self::CircuitOpen { breaker, .. } => {
                write!(f, "service temporarily unavailable (circuit '{}' open)", breaker)
            }
        }
    }
}

impl std::error::Error for AdmissionError {}

impl AdmissionError {
    /// Check if this error is a daily quota rejection
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
    /// Check if this error is a rate window rejection
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
    /// HTTP status for this rejection.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded { .. } | Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
    /// Wait hint.
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::QuotaExceeded { retry_after, .. }
            | Self::RateLimited { retry_after, .. }
            | Self::CircuitOpen { retry_after, .. } => *retry_after,
        }
    }
    /// Wait hint in whole seconds (rounded up, at least 1) for `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(self.retry_after())
    }
    /// Structured body sent to the client.
    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            success: false,
            status_code: self.status_code().as_u16(),
            message: self.to_string(),
            retry_after: self.retry_after_secs(),
            remaining: self.is_quota_exceeded().then_some(0),
            reset_at: match self {
                Self::QuotaExceeded { reset_at, .. } => Some(format_instant(*reset_at)),
                _ => None,
            },
        }
    }
}

/// JSON body for every rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RejectionBody {
    /// Always `false`.
    pub success: bool,
    /// HTTP status code, repeated in the body.
    pub status_code: u16,
    /// Human-readable reason.
    pub message: String,
    /// Seconds to wait before retrying.
    pub retry_after: u64,
    /// Requests left today, for quota rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    /// Quota reset instant (RFC 3339), for quota rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<String>,
}

impl RejectionBody {
    /// Serialize to JSON text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"Success":false,"StatusCode":{}}}"#, self.status_code)
        })
    }
}
