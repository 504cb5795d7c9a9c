//! Global bandwidth limiting for download workers.
//!
//! This module provides the [`RateLimiter`] struct, a token bucket shared
//! by every worker of every download:
//!
//! - tokens accrue at the configured rate, capped at a burst of twice
//!   the rate so short spikes can use idle capacity
//! - each downloaded byte consumes one token
//! - when the bucket runs dry a worker sleeps in bounded 100 ms slices,
//!   keeping pause/cancel signals responsive
//! - every successful call admits at least one byte, so a transfer can
//!   never starve completely
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use accel::download::RateLimiter;
//!
//! # async fn example() {
//! // Cap all transfers at 1 MiB/s.
//! let limiter = Arc::new(RateLimiter::new(1024 * 1024));
//!
//! // Ask for up to 64 KiB of budget; may admit less.
//! let permitted = limiter.request(64 * 1024).await;
//! # let _ = permitted;
//! # }
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

/// Longest single sleep while waiting for tokens; bounded so cancel
/// flags are observed promptly between slices.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Global token-bucket rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across all worker tasks.
/// The bucket state sits behind a mutex that is never held across an
/// await; sleeps happen with the lock released.
#[derive(Debug)]
pub struct RateLimiter {
    /// Configured rate in bytes/sec; 0 = unlimited.
    rate_bps: AtomicU64,
    /// Aggregate transfer speed across all downloads, maintained by the
    /// engine's speed aggregator (f64 bits).
    current_total_speed: AtomicU64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    burst_capacity: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter capped at `rate_bps` bytes per second.
    ///
    /// A rate of 0 creates a disabled limiter whose [`request`](Self::request)
    /// is a fast path returning the full amount.
    #[must_use]
    #[instrument]
    pub fn new(rate_bps: u64) -> Self {
        debug!("creating rate limiter");
        let burst = (rate_bps * 2) as f64;
        Self {
            rate_bps: AtomicU64::new(rate_bps),
            current_total_speed: AtomicU64::new(0),
            bucket: Mutex::new(Bucket {
                tokens: burst,
                burst_capacity: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a disabled limiter.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Returns whether limiting is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.rate_bps.load(Ordering::Relaxed) > 0
    }

    /// Returns the configured rate in bytes/sec (0 = unlimited).
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.rate_bps.load(Ordering::Relaxed)
    }

    /// Reconfigures the rate and resets the bucket to a full burst.
    pub fn set_limit(&self, rate_bps: u64) {
        self.rate_bps.store(rate_bps, Ordering::Relaxed);
        let mut bucket = self.lock_bucket();
        bucket.burst_capacity = (rate_bps * 2) as f64;
        bucket.tokens = bucket.burst_capacity;
        bucket.last_refill = Instant::now();
    }

    /// Refills the bucket to a full burst.
    pub fn reset(&self) {
        let mut bucket = self.lock_bucket();
        bucket.tokens = bucket.burst_capacity;
        bucket.last_refill = Instant::now();
    }

    /// Requests permission to transfer up to `n` bytes.
    ///
    /// Returns the number of bytes permitted now:
    /// - the full `n` when tokens cover it (or the limiter is disabled)
    /// - whatever partial budget is available when tokens are low
    /// - after a bounded sleep, at least 1 byte, guaranteeing forward
    ///   progress
    pub async fn request(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let rate = self.rate_bps.load(Ordering::Relaxed);
        if rate == 0 {
            return n; // disabled fast path
        }

        let wait = {
            let mut bucket = self.lock_bucket();
            bucket.refill(rate);

            if bucket.tokens >= n as f64 {
                bucket.tokens -= n as f64;
                return n;
            }
            if bucket.tokens >= 1.0 {
                let permitted = bucket.tokens as usize;
                bucket.tokens -= permitted as f64;
                return permitted;
            }

            // Empty: sleep roughly until the requested amount exists,
            // bounded to keep cancellation prompt.
            let needed_secs = n as f64 / rate as f64;
            Duration::from_secs_f64(needed_secs).min(MAX_WAIT_SLICE)
        };

        tokio::time::sleep(wait).await;

        let mut bucket = self.lock_bucket();
        bucket.refill(rate);
        if bucket.tokens >= 1.0 {
            let permitted = (bucket.tokens as usize).min(n);
            bucket.tokens -= permitted as f64;
            return permitted.max(1);
        }
        // Refilled less than one token; guarantee progress anyway.
        bucket.tokens = 0.0;
        1
    }

    /// Aggregate transfer speed across all downloads, in bytes/sec.
    #[must_use]
    pub fn current_total_speed(&self) -> f64 {
        f64::from_bits(self.current_total_speed.load(Ordering::Relaxed))
    }

    /// Records the aggregate transfer speed (called by the engine's
    /// speed aggregator).
    pub fn update_total_speed(&self, bps: f64) {
        self.current_total_speed
            .store(bps.to_bits(), Ordering::Relaxed);
    }

    fn lock_bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Bucket {
    /// Adds `elapsed * rate` tokens, capped at the burst capacity.
    fn refill(&mut self, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate as f64).min(self.burst_capacity);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_limiter_configuration() {
        let limiter = RateLimiter::new(100_000);
        assert!(limiter.is_enabled());
        assert_eq!(limiter.limit(), 100_000);
    }

    #[test]
    fn test_disabled_limiter() {
        let limiter = RateLimiter::disabled();
        assert!(!limiter.is_enabled());
        assert_eq!(limiter.limit(), 0);
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::disabled();
        assert_eq!(limiter.request(10_000_000).await, 10_000_000);
    }

    #[tokio::test]
    async fn test_burst_admitted_immediately() {
        // Bucket starts full at 2x rate.
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.request(2000).await, 2000);
    }

    #[tokio::test]
    async fn test_partial_grant_when_low() {
        let limiter = RateLimiter::new(1000);
        // Drain the burst.
        assert_eq!(limiter.request(1500).await, 1500);
        // ~500 tokens left: a 10_000-byte request gets a partial grant.
        let permitted = limiter.request(10_000).await;
        assert!(permitted >= 1);
        assert!(permitted <= 600, "permitted {permitted} exceeds remaining budget");
    }

    #[tokio::test]
    async fn test_empty_bucket_sleeps_then_grants() {
        tokio::time::pause();

        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.request(2000).await, 2000); // drain burst

        let start = Instant::now();
        let permitted = limiter.request(1000).await;
        // Forward progress is guaranteed even after a single wait slice.
        assert!(permitted >= 1);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_rate_cap_over_window() {
        tokio::time::pause();

        let rate = 100_000u64;
        let limiter = RateLimiter::new(rate);
        let mut admitted = 0usize;
        let start = Instant::now();

        // Pull as fast as possible for ~2 virtual seconds.
        while start.elapsed() < Duration::from_secs(2) {
            admitted += limiter.request(64 * 1024).await;
        }
        let elapsed = start.elapsed().as_secs_f64();

        // Token conservation: never more than the initial burst plus
        // what the elapsed time refilled.
        let cap = (2 * rate) as f64 + elapsed * rate as f64;
        assert!(
            admitted as f64 <= cap + 1.0,
            "admitted {admitted} exceeds cap {cap} over {elapsed:.2}s"
        );
        // And the window genuinely throttled: well below line rate.
        assert!(admitted >= (2 * rate) as usize);
    }

    #[tokio::test]
    async fn test_set_limit_resets_bucket() {
        let limiter = RateLimiter::new(1000);
        limiter.request(2000).await;
        limiter.set_limit(5000);
        // Fresh burst at the new rate.
        assert_eq!(limiter.request(10_000).await, 10_000);
    }

    #[test]
    fn test_total_speed_round_trip() {
        let limiter = RateLimiter::disabled();
        limiter.update_total_speed(123_456.5);
        assert!((limiter.current_total_speed() - 123_456.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_zero_byte_request() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.request(0).await, 0);
    }
}
