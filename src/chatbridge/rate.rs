//! Per-session token-bucket rate gate for model invocations.
//!
//! Each session carries its own bucket so one chat cannot starve another, and
//! self-induced throttling by rapid tool rounds is smoothed before the request
//! ever reaches the model service.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket: `capacity` tokens, one token refilled every
/// `refill_interval`.
pub struct TokenBucket {
    capacity: f64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity: capacity as f64,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                let refilled =
                    elapsed.as_secs_f64() / self.refill_interval.as_secs_f64().max(f64::EPSILON);
                state.tokens = (state.tokens + refilled).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Time until one full token accrues.
                self.refill_interval.mul_f64(1.0 - state.tokens)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token without waiting; false when the bucket is empty.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed();
        let refilled =
            elapsed.as_secs_f64() / self.refill_interval.as_secs_f64().max(f64::EPSILON);
        state.tokens = (state.tokens + refilled).min(self.capacity);
        state.last_refill = Instant::now();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
