#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ninegate::{
    AdmissionConfig, AdmissionGate, LoadProbe, LoadReading, ManualClock, OracleError,
    QuotaDecision, QuotaOracle, RateLimitRule, SamplingError, StaticQuotaOracle,
};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Fixed epoch so reset headers are predictable.
pub const T0: u64 = 1_700_000_000_000;

/// Probe whose reading the test controls.
#[derive(Debug, Default)]
pub struct FixedProbe {
    reading: Mutex<Option<(f64, f64)>>,
}

impl FixedProbe {
    pub fn set(&self, cpu: f64, memory: f64) {
        *self.reading.lock().unwrap() = Some((cpu, memory));
    }

    pub fn fail(&self) {
        *self.reading.lock().unwrap() = None;
    }
}

impl LoadProbe for FixedProbe {
    fn read(&self) -> Result<LoadReading, SamplingError> {
        match *self.reading.lock().unwrap() {
            Some((cpu_percent, memory_percent)) => Ok(LoadReading { cpu_percent, memory_percent }),
            None => Err(SamplingError::Unavailable("probe offline".into())),
        }
    }
}

pub struct Harness {
    pub gate: AdmissionGate,
    pub probe: Arc<FixedProbe>,
    pub oracle: Arc<StaticQuotaOracle>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(oracle: StaticQuotaOracle, config: AdmissionConfig) -> Self {
        let probe = Arc::new(FixedProbe::default());
        probe.set(10.0, 10.0);
        let oracle = Arc::new(oracle);
        let clock = ManualClock::new(T0);
        let gate = AdmissionGate::builder()
            .config(config)
            .shared_oracle(oracle.clone())
            .shared_probe(probe.clone())
            .clock(clock.clone())
            .build()
            .expect("valid gate");
        Self { gate, probe, oracle, clock }
    }

    /// Force a fresh load sample with the given CPU reading.
    pub fn load(&self, cpu: f64) {
        self.probe.set(cpu, 10.0);
        self.clock.advance(self.gate.config().load_check_interval());
        self.gate.monitor().sample();
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// Gate over an arbitrary oracle with normal load and the fixed clock.
pub fn gate_with_oracle(oracle: Arc<dyn QuotaOracle>) -> AdmissionGate {
    let probe = Arc::new(FixedProbe::default());
    probe.set(10.0, 10.0);
    AdmissionGate::builder()
        .shared_oracle(oracle)
        .shared_probe(probe)
        .clock(ManualClock::new(T0))
        .build()
        .expect("valid gate")
}

/// Oracle whose selected calls fail with `Unavailable`.
///
/// Calls that do not fail answer: unlimited quota, every principal trusted,
/// a 2-per-minute rule for every endpoint.
#[derive(Debug, Default)]
pub struct FailingOracle {
    pub quota: bool,
    pub trust: bool,
    pub rule: bool,
    pub usage: bool,
    pub usage_calls: AtomicUsize,
}

impl FailingOracle {
    pub fn all() -> Self {
        Self { quota: true, trust: true, rule: true, usage: true, ..Self::default() }
    }

    fn outage(failing: bool) -> Result<(), OracleError> {
        if failing {
            Err(OracleError::Unavailable("subscription store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QuotaOracle for FailingOracle {
    async fn daily_quota(&self, _principal: &str) -> Result<QuotaDecision, OracleError> {
        Self::outage(self.quota)?;
        Ok(QuotaDecision::unlimited())
    }

    async fn is_trusted(&self, _principal: &str) -> Result<bool, OracleError> {
        Self::outage(self.trust)?;
        Ok(true)
    }

    async fn rate_limit(
        &self,
        _principal: &str,
        _endpoint: &str,
    ) -> Result<Option<RateLimitRule>, OracleError> {
        Self::outage(self.rule)?;
        Ok(Some(RateLimitRule::new(2, 60)))
    }

    async fn record_usage(&self, _principal: &str, _endpoint: &str) -> Result<(), OracleError> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);
        Self::outage(self.usage)
    }
}

/// Install a capturing subscriber for the current thread.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let buffer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(buffer.clone()))
        .with_target(true)
        .without_time()
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

/// Captures fmt-layer output for log assertions.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
