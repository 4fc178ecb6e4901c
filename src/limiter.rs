// src/limiter.rs

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Paces data transfer. `advance` is called once per downloaded chunk and may
/// suspend the caller, it never fails.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn advance(&self, size: u64);
}

/// Used when download speed is not limited.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn advance(&self, _size: u64) {}
}

/// A token bucket shared by every worker of a batch, so the limit applies to
/// the aggregate transfer rate rather than to each task.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

/// The internal state of the token bucket.
struct BucketState {
    /// Maximum number of tokens (bytes) the bucket can hold. This controls burstiness.
    capacity: f64,
    /// Current allowance. Goes negative while callers are sleeping off a reservation.
    available: f64,
    /// Tokens added per second.
    rate: f64,
    last_refilled: Instant,
}

impl TokenBucket {
    /// Creates a bucket refilling at `rate_bytes_per_sec` with a burst of two seconds.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self::with_capacity(rate_bytes_per_sec, rate_bytes_per_sec.saturating_mul(2))
    }

    pub fn with_capacity(rate_bytes_per_sec: u64, capacity: u64) -> Self {
        assert!(rate_bytes_per_sec > 0, "token bucket rate must be positive");
        Self {
            state: Mutex::new(BucketState {
                capacity: capacity as f64,
                // Start empty so the very first bytes are already paced.
                available: 0.0,
                rate: rate_bytes_per_sec as f64,
                last_refilled: Instant::now(),
            }),
        }
    }

    /// Takes `size` tokens and returns how long the caller has to wait for them.
    async fn reserve(&self, size: u64) -> Duration {
        let mut bucket = self.state.lock().await;
        bucket.refill();

        let size = size as f64;
        let wait = if bucket.available < size {
            let deficit = size - bucket.available;
            Duration::from_secs_f64(deficit / bucket.rate)
        } else {
            Duration::ZERO
        };
        bucket.available -= size;
        wait
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn advance(&self, size: u64) {
        if size == 0 {
            return;
        }

        // The lock is released before sleeping; later callers see the
        // negative balance and queue up behind this reservation.
        let wait = self.reserve(size).await;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl BucketState {
    /// Adds tokens to the bucket based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refilled);
        self.available = (self.available + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refilled = now;
    }
}

/// Picks the limiter for a batch. `None` and `Some(0)` both mean unlimited.
pub fn for_rate(rate_limit: Option<u64>) -> Arc<dyn RateLimiter> {
    match rate_limit {
        Some(rate) if rate > 0 => Arc::new(TokenBucket::new(rate)),
        _ => Arc::new(Unlimited),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_sleeps() {
        let limiter = Unlimited;
        let start = Instant::now();
        for _ in 0..100 {
            limiter.advance(10 * 1024 * 1024).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_paces_to_rate() {
        let bucket = TokenBucket::new(1000);
        let start = Instant::now();
        for _ in 0..4 {
            bucket.advance(500).await;
        }
        // 2000 bytes at 1000 B/s from an empty bucket.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1990), "finished after {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2100), "finished after {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_after_idle() {
        let bucket = TokenBucket::new(1000);
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Capacity is capped at 2x rate regardless of how long it idled.
        let start = Instant::now();
        bucket.advance(2000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        bucket.advance(1000).await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_the_budget() {
        let bucket = Arc::new(TokenBucket::new(1000));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move { bucket.advance(500).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(1990));
    }

    #[tokio::test]
    async fn zero_rate_selects_unlimited() {
        let limiter = for_rate(Some(0));
        let start = std::time::Instant::now();
        limiter.advance(u32::MAX as u64).await;
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }
}
