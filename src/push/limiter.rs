//! Outbound rate limiting.
//!
//! A token bucket per pushkin bounds the sustained request rate towards a
//! provider. An empty bucket is reported as backpressure rather than queued:
//! the caller's retry loop supplies the backoff.

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Token bucket state under the lock.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting outbound requests for one pushkin.
#[derive(Debug)]
pub struct RateBucket {
    state: Mutex<BucketState>,
    /// Refill rate in tokens per second.
    rate: f64,
    /// Maximum bucket size.
    capacity: f64,
}

impl RateBucket {
    /// Create a bucket from configuration, starting full.
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = f64::from(config.requests_per_second.max(1));
        let capacity = f64::from(config.burst.unwrap_or(config.requests_per_second).max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate,
            capacity,
        }
    }

    /// Take one token if available.
    ///
    /// Returns `false` when the bucket is empty; the dispatch is then
    /// reported as a transient failure instead of waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
