//! Engine configuration.
//!
//! All knobs live here so a session's behavior is reproducible from its
//! config snapshot. Defaults match the calibration the engine ships with;
//! anything marked empirical should be overridden with care.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Configuration for one deliberation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum deliberation rounds before voting is forced.
    pub max_rounds: u32,
    /// Number of personas selected onto the panel.
    pub panel_size: usize,
    /// Similarity above which two contributions are duplicates. Overrides
    /// the duplicate filter's own threshold for the session.
    pub dedup_threshold: f64,
    /// Novelty rate at or below which a round counts as converged.
    pub convergence_novelty_rate: f64,
    /// Consecutive low-novelty rounds that trip the loop detector.
    pub max_stalled_rounds: u32,
    /// Session cost ceiling in dollars (0.0 = unlimited).
    pub cost_limit: f64,
    /// Wall-clock budget per external call, in milliseconds.
    pub call_timeout_ms: u64,
    /// Max concurrent persona turns within a round.
    pub max_parallel_turns: usize,
    /// Generation temperature for personas that do not set their own,
    /// before the facilitator's phase schedule.
    pub base_temperature: f32,
    /// Max tokens per model response.
    pub max_tokens: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            panel_size: 5,
            dedup_threshold: 0.80,
            convergence_novelty_rate: 0.34,
            max_stalled_rounds: 2,
            cost_limit: 0.0,
            call_timeout_ms: 120_000,
            max_parallel_turns: 4,
            base_temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

impl SessionConfig {
    /// Validate ranges that would otherwise fail deep inside a session.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_rounds == 0 {
            return Err(EngineError::Configuration(
                "max_rounds must be at least 1".into(),
            ));
        }
        if self.panel_size == 0 {
            return Err(EngineError::Configuration(
                "panel_size must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dedup_threshold) {
            return Err(EngineError::Configuration(format!(
                "dedup_threshold {} outside [0,1]",
                self.dedup_threshold
            )));
        }
        if self.max_parallel_turns == 0 {
            return Err(EngineError::Configuration(
                "max_parallel_turns must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Token-bucket settings for one external API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub time_window_seconds: f64,
    /// Bucket capacity. Defaults to `max_requests` when zero.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            time_window_seconds: 60.0,
            burst_size: 0,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, time_window_seconds: f64) -> Self {
        Self {
            max_requests,
            time_window_seconds,
            burst_size: 0,
        }
    }

    /// Set an explicit burst capacity.
    pub fn burst_size(mut self, burst: u32) -> Self {
        self.burst_size = burst;
        self
    }

    /// Effective bucket capacity.
    pub fn capacity(&self) -> f64 {
        if self.burst_size > 0 {
            self.burst_size as f64
        } else {
            self.max_requests as f64
        }
    }

    /// Tokens accumulated per second.
    pub fn refill_rate(&self) -> f64 {
        self.max_requests as f64 / self.time_window_seconds
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_requests == 0 {
            return Err(EngineError::Configuration(
                "max_requests must be at least 1".into(),
            ));
        }
        if self.time_window_seconds <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "time_window_seconds {} must be positive",
                self.time_window_seconds
            )));
        }
        Ok(())
    }
}

/// Settings for a response cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Feature toggle, fixed for the instance's lifetime.
    pub enabled: bool,
    /// Entry time-to-live in seconds.
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3_600,
        }
    }
}

/// Retry policy for transient external failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff delay for a given attempt number (0-indexed).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let delay =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether another retry is allowed given the attempt count.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn backoff_duration(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_ms(attempt))
    }
}

impl Default for RetryPolicy {
    /// Default: 2 retries, 500ms initial backoff, 2x multiplier, 5s max.
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}
