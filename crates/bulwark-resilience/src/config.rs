//! Engine configuration
//!
//! [`EngineConfig`] is the typed configuration surface. Every field has a
//! default; [`EngineConfig::validate`] repairs out-of-range values and reports
//! each repair as a [`ConfigRepair`], and rejects values that cannot be
//! repaired.

use bulwark_error::{BulwarkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MAX_RETRY_ATTEMPTS: u32 = 20;
const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
const MIN_HEALTH_INTERVAL_MS: u64 = 1_000;
const MIN_CLEANUP_INTERVAL_MS: u64 = 1_000;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum attempts per operation, including the first
    pub retry_attempts: u32,
    /// Delay before the second attempt
    pub retry_delay_ms: u64,
    /// Growth factor between successive delays
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff delay
    pub max_backoff_ms: u64,
    /// Inflate each delay by up to 10%
    pub jitter: bool,
    /// Per-attempt timeout; `None` disables it
    pub attempt_timeout_ms: Option<u64>,
    /// Failures that open a breaker
    pub circuit_breaker_threshold: u32,
    /// Half-open successes that close a breaker
    pub circuit_breaker_success_threshold: u32,
    /// Time a breaker stays open before a trial call
    pub circuit_breaker_cooldown_ms: u64,
    /// Interval between health checks
    pub health_check_interval_ms: u64,
    /// Time budget for a single probe
    pub probe_timeout_ms: u64,
    /// TTL applied when a write does not name one
    pub cache_default_ttl_ms: u64,
    /// Interval between expired-entry sweeps
    pub cache_cleanup_interval_ms: u64,
    /// Absolute age ceiling for entries restored from the durable tier
    pub cache_max_durable_age_ms: u64,
    /// Average latency above which the pipeline reports degraded
    pub latency_degraded_ms: u64,
    /// Run recovery after every non-healthy check
    pub auto_recovery_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: true,
            attempt_timeout_ms: Some(10_000),
            circuit_breaker_threshold: 5,
            circuit_breaker_success_threshold: 2,
            circuit_breaker_cooldown_ms: 60_000,
            health_check_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            cache_default_ttl_ms: 300_000,
            cache_cleanup_interval_ms: 300_000,
            cache_max_durable_age_ms: 86_400_000,
            latency_degraded_ms: 5_000,
            auto_recovery_enabled: true,
        }
    }
}

/// A value that [`EngineConfig::validate`] changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigRepair {
    /// Field name as it appears in the config file
    pub field: &'static str,
    /// Value before repair
    pub original: String,
    /// Value after repair
    pub applied: String,
    /// Why the value was changed
    pub reason: String,
}

impl ConfigRepair {
    fn new(
        field: &'static str,
        original: impl ToString,
        applied: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            field,
            original: original.to_string(),
            applied: applied.to_string(),
            reason: reason.into(),
        }
    }
}

impl EngineConfig {
    /// Create the default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BulwarkError::InvalidConfig(e.to_string()))
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BulwarkError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Set retry attempts
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the base retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = millis(delay);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout_ms = timeout.map(millis);
        self
    }

    /// Set the breaker failure threshold
    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    /// Set the breaker cooldown
    pub fn with_breaker_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_breaker_cooldown_ms = millis(cooldown);
        self
    }

    /// Set the health check interval
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = millis(interval);
        self
    }

    /// Set the default cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_default_ttl_ms = millis(ttl);
        self
    }

    /// Enable or disable automatic recovery
    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery_enabled = enabled;
        self
    }

    /// Check every field, repairing what can be repaired
    ///
    /// Returns the repaired config together with the list of repairs.
    /// Non-finite numbers and a zero cache TTL are rejected.
    pub fn validate(mut self) -> Result<(Self, Vec<ConfigRepair>)> {
        if !self.backoff_multiplier.is_finite() {
            return Err(BulwarkError::InvalidConfig(format!(
                "backoffMultiplier must be a finite number, got {}",
                self.backoff_multiplier
            )));
        }
        if self.cache_default_ttl_ms == 0 {
            return Err(BulwarkError::InvalidConfig(
                "cacheDefaultTtlMs must be greater than zero".to_string(),
            ));
        }

        let mut repairs = Vec::new();

        if self.retry_attempts == 0 {
            repairs.push(ConfigRepair::new("retryAttempts", 0, 1, "at least one attempt is required"));
            self.retry_attempts = 1;
        } else if self.retry_attempts > MAX_RETRY_ATTEMPTS {
            repairs.push(ConfigRepair::new(
                "retryAttempts",
                self.retry_attempts,
                MAX_RETRY_ATTEMPTS,
                "capped to avoid unbounded retry storms",
            ));
            self.retry_attempts = MAX_RETRY_ATTEMPTS;
        }

        if self.backoff_multiplier < 1.0 {
            repairs.push(ConfigRepair::new(
                "backoffMultiplier",
                self.backoff_multiplier,
                1.0,
                "delays must not shrink between attempts",
            ));
            self.backoff_multiplier = 1.0;
        } else if self.backoff_multiplier > MAX_BACKOFF_MULTIPLIER {
            repairs.push(ConfigRepair::new(
                "backoffMultiplier",
                self.backoff_multiplier,
                MAX_BACKOFF_MULTIPLIER,
                "capped",
            ));
            self.backoff_multiplier = MAX_BACKOFF_MULTIPLIER;
        }

        if self.max_backoff_ms < self.retry_delay_ms {
            repairs.push(ConfigRepair::new(
                "maxBackoffMs",
                self.max_backoff_ms,
                self.retry_delay_ms,
                "cap must not be below the base delay",
            ));
            self.max_backoff_ms = self.retry_delay_ms;
        }

        if self.attempt_timeout_ms == Some(0) {
            repairs.push(ConfigRepair::new("attemptTimeoutMs", 0, "null", "zero timeout disables the timeout"));
            self.attempt_timeout_ms = None;
        }

        if self.circuit_breaker_threshold == 0 {
            repairs.push(ConfigRepair::new(
                "circuitBreakerThreshold",
                0,
                1,
                "threshold must be at least one failure",
            ));
            self.circuit_breaker_threshold = 1;
        }

        if self.circuit_breaker_success_threshold == 0 {
            repairs.push(ConfigRepair::new(
                "circuitBreakerSuccessThreshold",
                0,
                1,
                "at least one trial success is required",
            ));
            self.circuit_breaker_success_threshold = 1;
        }

        if self.health_check_interval_ms < MIN_HEALTH_INTERVAL_MS {
            repairs.push(ConfigRepair::new(
                "healthCheckIntervalMs",
                self.health_check_interval_ms,
                MIN_HEALTH_INTERVAL_MS,
                "interval below the minimum",
            ));
            self.health_check_interval_ms = MIN_HEALTH_INTERVAL_MS;
        }

        if self.probe_timeout_ms == 0 || self.probe_timeout_ms > self.health_check_interval_ms {
            let applied = self.health_check_interval_ms.min(5_000).max(1);
            repairs.push(ConfigRepair::new(
                "probeTimeoutMs",
                self.probe_timeout_ms,
                applied,
                "probe timeout must be positive and fit inside the check interval",
            ));
            self.probe_timeout_ms = applied;
        }

        if self.cache_cleanup_interval_ms < MIN_CLEANUP_INTERVAL_MS {
            repairs.push(ConfigRepair::new(
                "cacheCleanupIntervalMs",
                self.cache_cleanup_interval_ms,
                MIN_CLEANUP_INTERVAL_MS,
                "interval below the minimum",
            ));
            self.cache_cleanup_interval_ms = MIN_CLEANUP_INTERVAL_MS;
        }

        if self.cache_max_durable_age_ms < self.cache_default_ttl_ms {
            repairs.push(ConfigRepair::new(
                "cacheMaxDurableAgeMs",
                self.cache_max_durable_age_ms,
                self.cache_default_ttl_ms,
                "durable age ceiling must cover the default TTL",
            ));
            self.cache_max_durable_age_ms = self.cache_default_ttl_ms;
        }

        for repair in &repairs {
            tracing::warn!(
                field = repair.field,
                original = %repair.original,
                applied = %repair.applied,
                "Config value repaired"
            );
        }

        Ok((self, repairs))
    }

    /// Base retry delay
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Backoff cap
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Per-attempt timeout
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    /// Breaker cooldown
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }

    /// Health check interval
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Default cache TTL
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_default_ttl_ms)
    }

    /// Cache sweep interval
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cache_cleanup_interval_ms)
    }

    /// Durable age ceiling
    pub fn max_durable_age(&self) -> Duration {
        Duration::from_millis(self.cache_max_durable_age_ms)
    }

    /// Degraded latency threshold
    pub fn latency_degraded(&self) -> Duration {
        Duration::from_millis(self.latency_degraded_ms)
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
