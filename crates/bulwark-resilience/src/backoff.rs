//! Exponential backoff with upward jitter
//!
//! The delay after attempt `n` is `base_delay * multiplier^(n-1)`, capped at
//! `max_delay`, then inflated by a uniform random fraction in
//! `[0, jitter_fraction]`. Jitter never shortens a delay.

use crate::config::EngineConfig;
use rand::Rng;
use std::time::Duration;

/// Default upward jitter, as a fraction of the delay
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;

/// Backoff strategy configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Upward jitter fraction (0.0 disables jitter)
    pub jitter_fraction: f64,
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            max_attempts: 3,
        }
    }
}

impl From<&EngineConfig> for BackoffConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            base_delay: config.retry_delay(),
            max_delay: config.max_backoff(),
            multiplier: config.backoff_multiplier,
            jitter_fraction: if config.jitter {
                DEFAULT_JITTER_FRACTION
            } else {
                0.0
            },
            max_attempts: config.retry_attempts,
        }
    }
}

impl BackoffConfig {
    /// Create a new backoff config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set jitter fraction (0.0 to 1.0)
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Set maximum attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Un-jittered delay after `attempt` (1-based) failed
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Delay after `attempt` failed, with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        with_jitter(self.base_delay_for(attempt), self.jitter_fraction)
    }
}

/// Inflate `delay` by a random fraction in `[0, fraction]`
pub fn with_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.0..=fraction);
    delay.mul_f64(1.0 + factor)
}
