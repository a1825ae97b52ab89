//! Token bucket behaviour under concurrent callers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use extract_core::scheduler::{RateLimitConfig, RateLimiter};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn consumption_never_outruns_refill() {
    let limiter = Arc::new(
        RateLimiter::new(RateLimitConfig { capacity: 5, refill_per_sec: 10.0 })
            .with_poll_interval(Duration::from_millis(10)),
    );
    let granted = Arc::new(AtomicU32::new(0));
    let started = Instant::now();
    let deadline = started + Duration::from_secs(2);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let limiter = Arc::clone(&limiter);
        let granted = Arc::clone(&granted);
        handles.push(tokio::spawn(async move {
            while limiter.acquire(1, deadline).await.is_ok() {
                granted.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = started.elapsed().as_secs_f64();
    let bound = 5.0 + 10.0 * elapsed;
    let total = f64::from(granted.load(Ordering::SeqCst));
    assert!(total <= bound + 1e-9, "granted {total} > bound {bound}");
    // Callers were saturating the bucket, so most of the budget was used.
    assert!(total >= bound - 2.0, "granted {total}, expected close to {bound}");
}

#[tokio::test(start_paused = true)]
async fn fresh_bucket_admits_full_burst() {
    let limiter = RateLimiter::new(RateLimitConfig::per_second(3.0));
    assert!(limiter.try_consume(1));
    assert!(limiter.try_consume(1));
    assert!(limiter.try_consume(1));
    assert!(!limiter.try_consume(1));

    tokio::time::advance(Duration::from_millis(340)).await;
    assert!(limiter.try_consume(1));
    assert!(!limiter.try_consume(1));
}

#[tokio::test(start_paused = true)]
async fn acquire_waits_for_refill() {
    let limiter = RateLimiter::new(RateLimitConfig { capacity: 1, refill_per_sec: 2.0 });
    let far = Instant::now() + Duration::from_secs(10);
    assert_eq!(limiter.acquire(1, far).await.unwrap(), Duration::ZERO);

    let waited = limiter.acquire(1, far).await.unwrap();
    assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
    assert!(waited < Duration::from_millis(600), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn acquire_gives_up_at_deadline() {
    let limiter = RateLimiter::new(RateLimitConfig { capacity: 1, refill_per_sec: 0.1 });
    assert!(limiter.try_consume(1));

    let deadline = Instant::now() + Duration::from_millis(200);
    let err = limiter.acquire(1, deadline).await.unwrap_err();
    assert!(err.waited >= Duration::from_millis(200));
    assert!(Instant::now() >= deadline);
}

#[tokio::test]
async fn oversized_request_fails_immediately() {
    let limiter = RateLimiter::new(RateLimitConfig { capacity: 2, refill_per_sec: 100.0 });
    let err = limiter
        .acquire(3, Instant::now() + Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.waited, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn snapshot_reports_refilled_tokens() {
    let limiter = RateLimiter::new(RateLimitConfig { capacity: 4, refill_per_sec: 1.0 });
    for _ in 0..4 {
        assert!(limiter.try_consume(1));
    }
    tokio::time::advance(Duration::from_secs(2)).await;

    let state = limiter.snapshot();
    assert!((state.tokens - 2.0).abs() < 1e-6, "tokens {}", state.tokens);
    assert_eq!(state.capacity, 4.0);
    assert_eq!(state.refill_rate, 1.0);
}
