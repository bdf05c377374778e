//! System load sensing.
//!
//! [`LoadMonitor`] polls a [`LoadProbe`] at most once per check interval and
//! publishes the result as a [`LoadSample`]. The request path only ever reads
//! the published sample, so a slow or broken probe never adds latency to a
//! request. The monitor is also the only component that moves the high-load
//! circuit breaker in response to load: it trips the breaker at extreme load
//! and resets it once load is back to normal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adaptive::DynamicConfig;
use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_registry::BreakerRegistry;
use crate::clock::{duration_millis, Clock, MonotonicClock};
use crate::config::AdmissionConfig;

const NEVER_SAMPLED: u64 = u64::MAX;

/// Raw utilization numbers from a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadReading {
    /// CPU utilization, 0..=100.
    pub cpu_percent: f64,
    /// Memory utilization, 0..=100.
    pub memory_percent: f64,
}

/// A probe could not produce a reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SamplingError {
    /// Sampling is not supported here.
    #[error("load sampling unavailable: {0}")]
    Unavailable(String),
}

/// Source of CPU and memory utilization.
pub trait LoadProbe: Send + Sync + std::fmt::Debug {
    /// Take one reading. Must not block for long.
    fn read(&self) -> Result<LoadReading, SamplingError>;
}

/// Probe for environments without load sampling; every read fails, so the
/// monitor reports normal load.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableProbe;

impl LoadProbe for UnavailableProbe {
    fn read(&self) -> Result<LoadReading, SamplingError> {
        Err(SamplingError::Unavailable("no probe configured".into()))
    }
}

/// Host probe backed by `sysinfo`.
///
/// CPU usage is measured between consecutive reads, so the first reading
/// after construction reports 0%.
#[cfg(feature = "system-probe")]
#[derive(Debug)]
pub struct SysinfoProbe {
    system: std::sync::Mutex<sysinfo::System>,
}

#[cfg(feature = "system-probe")]
impl Default for SysinfoProbe {
    fn default() -> Self {
        Self { system: std::sync::Mutex::new(sysinfo::System::new()) }
    }
}

#[cfg(feature = "system-probe")]
impl SysinfoProbe {
    /// New probe with an empty baseline.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "system-probe")]
impl LoadProbe for SysinfoProbe {
    fn read(&self) -> Result<LoadReading, SamplingError> {
        let mut sys = self
            .system
            .lock()
            .map_err(|_| SamplingError::Unavailable("sysinfo state poisoned".into()))?;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return Err(SamplingError::Unavailable("total memory reported as zero".into()));
        }
        Ok(LoadReading {
            cpu_percent: f64::from(sys.global_cpu_usage()),
            memory_percent: sys.used_memory() as f64 / total as f64 * 100.0,
        })
    }
}

/// Last published load classification.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LoadSample {
    /// CPU utilization at sampling time.
    pub cpu_percent: f64,
    /// Memory utilization at sampling time.
    pub memory_percent: f64,
    /// Clock reading (millis) of the sample.
    pub sampled_at: u64,
    /// Whether either value exceeded the high-load threshold.
    pub is_high_load: bool,
}

/// Debounced CPU/memory classifier that also drives the high-load breaker.
#[derive(Debug)]
pub struct LoadMonitor {
    probe: Arc<dyn LoadProbe>,
    registry: Arc<dyn BreakerRegistry>,
    config: DynamicConfig<AdmissionConfig>,
    current: ArcSwap<LoadSample>,
    last_checked: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl LoadMonitor {
    /// Build a monitor. Nothing is sampled until [`sample`](Self::sample) or
    /// [`spawn`](Self::spawn) runs; until then load is reported as normal.
    pub fn new(
        probe: Arc<dyn LoadProbe>,
        registry: Arc<dyn BreakerRegistry>,
        config: DynamicConfig<AdmissionConfig>,
    ) -> Self {
        Self {
            probe,
            registry,
            config,
            current: ArcSwap::from_pointee(LoadSample::default()),
            last_checked: AtomicU64::new(NEVER_SAMPLED),
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

    /// Cached classification from the last sample.
    pub fn is_high_load(&self) -> bool {
        self.current.load().is_high_load
    }

    /// Last published sample.
    pub fn current(&self) -> LoadSample {
        **self.current.load()
    }

    /// Sample the probe if the check interval has elapsed, otherwise return the
    /// cached sample. Concurrent callers inside the same interval do not
    /// re-sample; exactly one of them reads the probe.
    pub fn sample(&self) -> LoadSample {
        self.sample_inner(false)
    }

    /// Sample the probe regardless of when the last sample was taken. A
    /// concurrent sampler that wins the race still suppresses this read.
    pub fn sample_now(&self) -> LoadSample {
        self.sample_inner(true)
    }

    fn sample_inner(&self, force: bool) -> LoadSample {
        let config = self.config.get();
        let now = self.clock.now_millis();
        let last = self.last_checked.load(Ordering::Acquire);
        let interval = duration_millis(config.load_check_interval());

        if !force && last != NEVER_SAMPLED && now.saturating_sub(last) < interval {
            return self.current();
        }
        if self
            .last_checked
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.current();
        }

        let sample = match self.probe.read() {
            Ok(reading) => {
                let sample = LoadSample {
                    cpu_percent: reading.cpu_percent,
                    memory_percent: reading.memory_percent,
                    sampled_at: now,
                    is_high_load: reading.cpu_percent > config.high_load_threshold_percent
                        || reading.memory_percent > config.high_load_threshold_percent,
                };
                self.publish(sample);
                self.drive_breaker(&config, &reading, sample.is_high_load);
                sample
            }
            Err(err) => {
                warn!(error = %err, "load sampling failed; treating system as normal load");
                let sample = LoadSample { sampled_at: now, ..LoadSample::default() };
                self.publish(sample);
                sample
            }
        };
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            high_load = sample.is_high_load,
            "load sampled"
        );
        sample
    }

    /// Sample on a background ticker, one check interval apart. Every tick
    /// reads the probe; the ticker already spaces the reads. Probe reads run
    /// on the blocking pool.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.get().load_check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let monitor = self.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || monitor.sample_now()).await {
                    warn!(error = %err, "load sampling task failed");
                }
            }
        })
    }

    fn publish(&self, sample: LoadSample) {
        let prev = self.current.swap(Arc::new(sample));
        if prev.is_high_load != sample.is_high_load {
            if sample.is_high_load {
                warn!(cpu = sample.cpu_percent, memory = sample.memory_percent, "system entered high load");
            } else {
                info!(cpu = sample.cpu_percent, memory = sample.memory_percent, "system load back to normal");
            }
        }
    }

    fn drive_breaker(&self, config: &AdmissionConfig, reading: &LoadReading, high_load: bool) {
        let extreme = config.extreme_load_threshold_percent;
        let breaker = self.registry.get_or_create(&config.breaker_name, &config.breaker_config());

        if reading.cpu_percent > extreme || reading.memory_percent > extreme {
            if breaker.trip() {
                warn!(
                    breaker = breaker.name(),
                    cpu = reading.cpu_percent,
                    memory = reading.memory_percent,
                    "extreme load; breaker tripped"
                );
            }
        } else if !high_load && breaker.state() == CircuitState::Open {
            breaker.reset();
            info!(breaker = breaker.name(), "load normal; breaker reset");
        }
    }
}
