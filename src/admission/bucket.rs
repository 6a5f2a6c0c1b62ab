//! Refill-on-read token bucket.

use std::time::Duration;

/// Bucket parameters shared by every host.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { capacity: 10.0, refill_per_second: 5.0 }
    }
}

/// Token bucket for one host. Tokens are replenished lazily from the elapsed
/// time on each acquisition attempt, so no background task is needed.
#[derive(Debug)]
pub struct TokenBucket {
    config: BucketConfig,
    tokens: f64,
    last_refill_millis: u64,
}

impl TokenBucket {
    /// New bucket, initially full.
    pub fn new(config: BucketConfig, now_millis: u64) -> Self {
        Self { config, tokens: config.capacity, last_refill_millis: now_millis }
    }

    /// Take one token, or report how long until the next one exists.
    pub fn try_acquire(&mut self, now_millis: u64) -> Result<(), Duration> {
        self.refill(now_millis);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            let wait_secs = missing / self.config.refill_per_second;
            Err(Duration::from_secs_f64(wait_secs))
        }
    }

    fn refill(&mut self, now_millis: u64) {
        let elapsed_secs =
            (now_millis.saturating_sub(self.last_refill_millis)) as f64 / 1_000.0;
        if elapsed_secs > 0.0 {
            self.tokens =
                (self.tokens + elapsed_secs * self.config.refill_per_second).min(self.config.capacity);
            self.last_refill_millis = now_millis;
        }
    }
}
