//! Fixed-window rate limiting keyed by `(principal, endpoint)`.
//!
//! Each key owns a [`WindowState`]. Acquisition runs under the DashMap shard
//! lock for that key, so reset-or-increment is a single linearizable step and
//! two callers racing for the last permit cannot both win. Different keys on
//! different shards never contend.
//!
//! Rejections never queue: overflow inside a window is dropped and the caller
//! decides how to surface it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::clock::{duration_millis, Clock, SystemClock};

/// Composite limiter identity.
///
/// `principal` is the authenticated user id, or the client address for
/// anonymous callers. The gate builds keys through [`LimiterKey::user`] and
/// [`LimiterKey::client`] so the two kinds never share a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    principal: String,
    endpoint: String,
}

impl LimiterKey {
    /// Build a key from a principal and a normalized endpoint, verbatim.
    pub fn new(principal: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { principal: principal.into(), endpoint: endpoint.into() }
    }

    /// Key for an authenticated user.
    pub fn user(id: &str, endpoint: impl Into<String>) -> Self {
        Self::new(format!("user:{id}"), endpoint)
    }

    /// Key for an anonymous caller identified by network address.
    pub fn client(addr: &str, endpoint: impl Into<String>) -> Self {
        Self::new(format!("ip:{addr}"), endpoint)
    }

    /// Principal part of the key.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Endpoint part of the key.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.principal, self.endpoint)
    }
}

/// Counter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Clock reading (millis) at which the current window opened.
    pub window_start: u64,
    /// Permits handed out in the current window.
    pub count: u32,
    /// Limit applied on the most recent acquisition.
    pub limit: u32,
    /// Window length applied on the most recent acquisition.
    pub window: Duration,
}

impl WindowState {
    /// Clock reading (millis) at which the current window closes.
    pub fn reset_at(&self) -> u64 {
        self.window_start.saturating_add(duration_millis(self.window))
    }
}

/// Outcome of [`WindowedLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A permit was taken.
    Acquired {
        /// Limit in force for this window.
        limit: u32,
        /// Permits left after this acquisition.
        remaining: u32,
        /// Clock reading (millis) at which the window resets.
        reset_at: u64,
    },
    /// The window is exhausted.
    Rejected {
        /// Limit in force for this window.
        limit: u32,
        /// Time left until the window resets.
        retry_after: Duration,
        /// Clock reading (millis) at which the window resets.
        reset_at: u64,
    },
}

impl Decision {
    /// Whether a permit was taken.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Decision::Acquired { .. })
    }

    /// Limit in force for the window.
    pub fn limit(&self) -> u32 {
        match self {
            Decision::Acquired { limit, .. } | Decision::Rejected { limit, .. } => *limit,
        }
    }

    /// Remaining permits; zero when rejected.
    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Acquired { remaining, .. } => *remaining,
            Decision::Rejected { .. } => 0,
        }
    }

    /// Window reset instant in clock millis.
    pub fn reset_at(&self) -> u64 {
        match self {
            Decision::Acquired { reset_at, .. } | Decision::Rejected { reset_at, .. } => *reset_at,
        }
    }

    /// Wait hint for rejected acquisitions.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Rejected { retry_after, .. } => Some(*retry_after),
            Decision::Acquired { .. } => None,
        }
    }
}

/// Default multiple of the window after which an idle key is evicted.
pub const DEFAULT_EVICTION_FACTOR: u32 = 2;

/// In-memory fixed-window limiter.
///
/// Clones share the same window map.
#[derive(Debug, Clone)]
pub struct WindowedLimiter {
    windows: Arc<DashMap<LimiterKey, WindowState>>,
    clock: Arc<dyn Clock>,
    eviction_factor: u32,
}

impl Default for WindowedLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowedLimiter {
    /// Limiter backed by the wall clock.
    pub fn new() -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            clock: Arc::new(SystemClock),
            eviction_factor: DEFAULT_EVICTION_FACTOR,
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

    /// Evict keys idle for more than `factor` windows. Zero is treated as one.
    pub fn with_eviction_factor(mut self, factor: u32) -> Self {
        self.eviction_factor = factor.max(1);
        self
    }

    /// Try to take one permit for `key`.
    ///
    /// The window resets when at least `window` has elapsed since it opened.
    /// `limit` and `window` are re-applied on every call so a key picks up a
    /// changed limit (for example a load reduction) without waiting for the
    /// next window.
    pub fn try_acquire(&self, key: &LimiterKey, limit: u32, window: Duration) -> Decision {
        let now = self.clock.now_millis();
        let window_ms = duration_millis(window);

        let mut entry = self.windows.entry(key.clone()).or_insert_with(|| WindowState {
            window_start: now,
            count: 0,
            limit,
            window,
        });
        let state = entry.value_mut();

        if now.saturating_sub(state.window_start) >= window_ms {
            state.window_start = now;
            state.count = 0;
        }
        state.limit = limit;
        state.window = window;

        let reset_at = state.reset_at();
        if state.count < limit {
            state.count += 1;
            Decision::Acquired { limit, remaining: limit - state.count, reset_at }
        } else {
            let retry_after = Duration::from_millis(reset_at.saturating_sub(now));
            debug!(key = %key, limit, ?retry_after, "window exhausted");
            Decision::Rejected { limit, retry_after, reset_at }
        }
    }

    /// Current window for `key` without consuming a permit.
    pub fn peek(&self, key: &LimiterKey) -> Option<WindowState> {
        self.windows.get(key).map(|s| *s.value())
    }

    /// Drop keys whose window has been stale for `eviction_factor` windows.
    /// Returns the number of evicted keys.
    pub fn evict_stale(&self) -> usize {
        let now = self.clock.now_millis();
        let factor = u64::from(self.eviction_factor);
        let before = self.windows.len();
        self.windows.retain(|_, state| {
            let ttl = duration_millis(state.window).saturating_mul(factor);
            now.saturating_sub(state.window_start) < ttl
        });
        before.saturating_sub(self.windows.len())
    }

    /// Run [`evict_stale`](Self::evict_stale) every `every` on the tokio runtime.
    pub fn spawn_janitor(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = limiter.evict_stale();
                if evicted > 0 {
                    debug!(evicted, tracked = limiter.len(), "evicted idle limiter windows");
                }
            }
        })
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
