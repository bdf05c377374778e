use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ninegate::{
    AdmissionConfig, AdmissionGate, LimiterKey, RequestMeta, StaticQuotaOracle, UnavailableProbe,
    WindowedLimiter,
};

use std::time::Duration;

fn limiter_hot_key(c: &mut Criterion) {
    let limiter = WindowedLimiter::new();
    let key = LimiterKey::new("u1", "/api/tasks");

    c.bench_function("limiter_try_acquire_hot_key", |b| {
        b.iter(|| black_box(limiter.try_acquire(black_box(&key), u32::MAX, Duration::from_secs(60))));
    });
}

fn limiter_spread_keys(c: &mut Criterion) {
    let limiter = WindowedLimiter::new();
    let keys: Vec<_> = (0..1024).map(|i| LimiterKey::new(format!("u{i}"), "/api/tasks")).collect();
    let mut i = 0usize;

    c.bench_function("limiter_try_acquire_1k_keys", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(limiter.try_acquire(&keys[i], u32::MAX, Duration::from_secs(60)))
        });
    });
}

fn gate_guard(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut limits = ninegate::CategoryLimits::default();
    limits.general = ninegate::RateLimitRule::new(u32::MAX, 60);
    let gate = AdmissionGate::builder()
        .config(AdmissionConfig::default().with_limits(limits))
        .oracle(StaticQuotaOracle::new())
        .probe(UnavailableProbe)
        .build()
        .unwrap();
    let meta = RequestMeta::new("/api/projects/42").with_client_addr("10.0.0.1");

    c.bench_function("gate_guard_admitted", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(gate.guard(&meta, || async { Ok::<_, std::io::Error>(()) }).await);
        });
    });
}

criterion_group!(benches, limiter_hot_key, limiter_spread_keys, gate_guard);
criterion_main!(benches);
