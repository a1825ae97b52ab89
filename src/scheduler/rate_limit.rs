//! Token bucket guarding calls to the shared upstream quota.
//!
//! Tokens refill continuously as `min(capacity, tokens + elapsed * rate)`.
//! The bucket starts full, so a fresh limiter admits a burst of `capacity`.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Configuration for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens the bucket holds.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { capacity: 10, refill_per_sec: 5.0 }
    }
}

impl RateLimitConfig {
    /// Bucket for a requests-per-second budget, burst of `max(1, ceil(rate))`.
    pub fn per_second(rate: f64) -> Self {
        let capacity = rate.ceil().max(1.0).min(u32::MAX as f64) as u32;
        Self { capacity, refill_per_sec: rate }
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitState {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    /// Time since the last refill computation.
    #[serde(with = "duration_ms")]
    pub since_refill: Duration,
}

/// Waiting for tokens ran past the caller's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit wait exceeded deadline after {waited:?}")]
pub struct RateLimitTimeout {
    pub waited: Duration,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. One mutator at a time.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_rate: f64,
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            bucket: Mutex::new(Bucket { tokens: capacity, last_refill: Instant::now() }),
            capacity,
            refill_rate: config.refill_per_sec.max(0.0),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Upper bound on a single sleep inside [`acquire`](Self::acquire).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Take `n` tokens if available right now.
    pub fn try_consume(&self, n: u32) -> bool {
        self.try_consume_at(n, Instant::now()).is_ok()
    }

    /// Wait until `n` tokens are taken, giving up at `deadline`.
    ///
    /// Returns how long the caller waited. A request larger than the bucket
    /// can never be satisfied and fails immediately.
    pub async fn acquire(&self, n: u32, deadline: Instant) -> Result<Duration, RateLimitTimeout> {
        let started = Instant::now();
        if f64::from(n) > self.capacity {
            return Err(RateLimitTimeout { waited: Duration::ZERO });
        }
        loop {
            let now = Instant::now();
            let needed = match self.try_consume_at(n, now) {
                Ok(()) => return Ok(now - started),
                Err(deficit) => deficit,
            };
            if now >= deadline {
                return Err(RateLimitTimeout { waited: now - started });
            }
            let until_ready = if self.refill_rate > 0.0 {
                Duration::from_secs_f64(needed / self.refill_rate)
            } else {
                self.poll_interval
            };
            let sleep_for = until_ready
                .min(self.poll_interval)
                .min(deadline - now)
                .max(Duration::from_millis(1));
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Current bucket state after refill.
    pub fn snapshot(&self) -> RateLimitState {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        RateLimitState {
            tokens: bucket.tokens,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            since_refill: now.saturating_duration_since(bucket.last_refill),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Returns the token deficit on denial.
    fn try_consume_at(&self, n: u32, now: Instant) -> Result<(), f64> {
        let wanted = f64::from(n);
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            Ok(())
        } else {
            Err(wanted - bucket.tokens)
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish()
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starts_full_and_denies_past_capacity() {
        let limiter = RateLimiter::new(RateLimitConfig { capacity: 3, refill_per_sec: 1.0 });
        assert!(limiter.try_consume(1));
        assert!(limiter.try_consume(2));
        assert!(!limiter.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time_without_exceeding_capacity() {
        let limiter = RateLimiter::new(RateLimitConfig { capacity: 2, refill_per_sec: 2.0 });
        assert!(limiter.try_consume(2));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_consume(1));
        assert!(!limiter.try_consume(1));

        tokio::time::advance(Duration::from_secs(60)).await;
        let state = limiter.snapshot();
        assert_eq!(state.tokens, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimitConfig { capacity: 1, refill_per_sec: 4.0 });
        assert!(limiter.try_consume(1));
        let deadline = Instant::now() + Duration::from_secs(5);
        let waited = limiter.acquire(1, deadline).await.unwrap();
        assert!(waited >= Duration::from_millis(250));
        assert!(waited < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_gives_up_at_deadline() {
        let limiter = RateLimiter::new(RateLimitConfig { capacity: 1, refill_per_sec: 0.1 });
        assert!(limiter.try_consume(1));
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = limiter.acquire(1, deadline).await.unwrap_err();
        assert!(err.waited >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_fails_fast() {
        let limiter = RateLimiter::new(RateLimitConfig { capacity: 2, refill_per_sec: 10.0 });
        let deadline = Instant::now() + Duration::from_secs(10);
        assert!(limiter.acquire(3, deadline).await.is_err());
    }

    #[test]
    fn per_second_rounds_capacity_up() {
        assert_eq!(RateLimitConfig::per_second(2.5).capacity, 3);
        assert_eq!(RateLimitConfig::per_second(0.2).capacity, 1);
    }
}
