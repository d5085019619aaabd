//! Global token-bucket rate limiter for exchange calls.
//!
//! Shared by every caller of the exchange client; the bucket refills at a
//! fixed rate and `acquire` suspends until a token is available, so bursts
//! queue instead of hammering the venue.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Non-blocking attempt; true when a token was consumed.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.state.lock();
        self.refill(&mut st);
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Suspend until a token is available. Cancellation-safe: dropping the
    /// future between sleeps consumes nothing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock();
                self.refill(&mut st);
                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    return;
                }
                // time until one token accrues
                Duration::from_secs_f64((1.0 - st.tokens) / self.refill_per_sec)
            };
            sleep(wait.min(Duration::from_millis(250))).await;
        }
    }

    fn refill(&self, st: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            st.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_limited_to_capacity() {
        let bucket = TokenBucket::new(3, 1.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(1, 50.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        // 50 tokens/sec -> one token well within 100ms
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test]
    async fn acquire_suspends_then_succeeds() {
        let bucket = TokenBucket::new(1, 20.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // second acquire had to wait for a refill
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
