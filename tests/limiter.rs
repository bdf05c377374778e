mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::T0;
use ninegate::{LimiterKey, ManualClock, WindowedLimiter};
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_admit_exactly_the_limit() {
    const LIMIT: u32 = 25;
    let limiter = WindowedLimiter::new().with_clock(ManualClock::new(T0));
    let key = LimiterKey::new("u1", "/api/reports");
    let admitted = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(Barrier::new((LIMIT * 2) as usize));

    let handles: Vec<_> = (0..LIMIT * 2)
        .map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            let admitted = admitted.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                if limiter.try_acquire(&key, LIMIT, Duration::from_secs(60)).is_acquired() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), LIMIT);
    assert_eq!(limiter.peek(&key).unwrap().count, LIMIT);
}

#[test]
fn remaining_counts_down_then_rejects_for_the_rest_of_the_window() {
    let clock = ManualClock::new(T0);
    let limiter = WindowedLimiter::new().with_clock(clock.clone());
    let key = LimiterKey::new("10.0.0.1", "/auth/login");
    let window = Duration::from_secs(60);

    let remaining: Vec<u32> =
        (0..5).map(|_| limiter.try_acquire(&key, 5, window).remaining()).collect();
    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

    let rejected = limiter.try_acquire(&key, 5, window);
    assert_eq!(rejected.retry_after(), Some(window));

    clock.advance(Duration::from_secs(59));
    assert!(!limiter.try_acquire(&key, 5, window).is_acquired());

    clock.advance(Duration::from_secs(1));
    let fresh = limiter.try_acquire(&key, 5, window);
    assert!(fresh.is_acquired());
    assert_eq!(fresh.remaining(), 4);
}

#[test]
fn keys_are_independent() {
    let limiter = WindowedLimiter::new().with_clock(ManualClock::new(T0));
    let window = Duration::from_secs(60);
    let login = LimiterKey::new("u1", "/auth/login");
    let tasks = LimiterKey::new("u1", "/api/tasks");

    assert!(limiter.try_acquire(&login, 1, window).is_acquired());
    assert!(!limiter.try_acquire(&login, 1, window).is_acquired());
    assert!(limiter.try_acquire(&tasks, 1, window).is_acquired());
    assert_eq!(limiter.len(), 2);
}

#[test]
fn idle_keys_are_evicted_after_two_windows() {
    let clock = ManualClock::new(T0);
    let limiter = WindowedLimiter::new().with_clock(clock.clone());
    let window = Duration::from_secs(30);
    limiter.try_acquire(&LimiterKey::new("a", "/x"), 5, window);

    clock.advance(Duration::from_secs(59));
    assert_eq!(limiter.evict_stale(), 0);
    clock.advance(Duration::from_secs(1));
    assert_eq!(limiter.evict_stale(), 1);
    assert!(limiter.is_empty());
}
