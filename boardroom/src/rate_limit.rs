//! Token-bucket rate limiter for external research/model APIs.
//!
//! One limiter instance per external API name, shared for the process
//! lifetime (see [`crate::registry::ResourceRegistry`]). `acquire` waits
//! instead of erroring: contention is never a failure, only invalid
//! configuration is.
//!
//! Tokens accumulate at `max_requests / time_window_seconds` per second up
//! to `burst_size`, and are allowed to be fractional internally. Refill uses
//! the runtime's monotonic clock, so wall-clock jumps cannot mint or destroy
//! tokens.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::RateLimitConfig;
use crate::error::{EngineError, EngineResult};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Lazily credit tokens for the time elapsed since the last refill.
    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(capacity);
            self.last_refill = now;
        }
    }
}

/// A token-bucket limiter for one external API.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter. Fails only on invalid configuration.
    pub fn new(name: &str, config: RateLimitConfig) -> EngineResult<Self> {
        config.validate()?;
        let capacity = config.capacity();
        Ok(Self {
            name: name.to_string(),
            config,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// API name this limiter throttles.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire `n` tokens, waiting as long as necessary. Returns the time
    /// spent waiting in seconds (0.0 when tokens were immediately available).
    pub async fn acquire(&self, n: u32) -> EngineResult<f64> {
        let needed = n as f64;
        if needed > self.config.capacity() {
            return Err(EngineError::Configuration(format!(
                "cannot acquire {} tokens from limiter '{}' with capacity {}",
                n,
                self.name,
                self.config.capacity()
            )));
        }

        let rate = self.config.refill_rate();
        let capacity = self.config.capacity();
        let start = Instant::now();
        let mut slept = false;

        loop {
            let sleep_for = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(rate, capacity);
                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    let waited = if slept {
                        start.elapsed().as_secs_f64()
                    } else {
                        0.0
                    };
                    trace!(
                        limiter = %self.name,
                        tokens_left = bucket.tokens,
                        waited_s = waited,
                        "tokens acquired"
                    );
                    return Ok(waited);
                }
                // Not enough; sleep for the deficit, then re-check. The
                // second refill pass after the sleep is what guards against
                // under-waiting when the clock granularity works against us.
                let deficit = needed - bucket.tokens;
                deficit / rate
            };

            debug!(
                limiter = %self.name,
                wait_s = sleep_for,
                "rate limit reached, waiting for refill"
            );
            slept = true;
            tokio::time::sleep(Duration::from_secs_f64(sleep_for)).await;
        }
    }

    /// Non-blocking read of the current token count, after a lazy refill.
    /// Never exceeds the burst capacity and never goes negative.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.config.refill_rate(), self.config.capacity());
        bucket.tokens
    }
}
