//! Token-bucket rate limiting for object store calls.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A token bucket; callers await [`TokenBucket::acquire`] before each
/// operation.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket allowing `ops_per_sec` sustained operations, with a
    /// burst capacity of the same size.
    pub fn new(ops_per_sec: f64) -> Self {
        Self {
            capacity: ops_per_sec,
            refill_per_sec: ops_per_sec,
            state: Mutex::new(BucketState {
                tokens: ops_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_immediate() {
        let bucket = TokenBucket::new(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn exhausted_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(50.0);
        for _ in 0..50 {
            bucket.acquire().await;
        }
        let start = Instant::now();
        bucket.acquire().await;
        // one token refills in 1/50 s
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
