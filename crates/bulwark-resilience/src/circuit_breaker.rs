//! Circuit breaker registry
//!
//! One breaker per resource key, created lazily on first use and kept for the
//! life of the process. Every transition for a key happens under that key's
//! map shard lock with no suspension point, so concurrent callers never see a
//! half-applied transition.
//!
//! - CLOSED: failures count up; at the threshold the breaker opens. Each
//!   success takes one failure off the count.
//! - OPEN: calls are rejected until the cooldown elapses, then the next call
//!   moves the breaker to HALF_OPEN and passes as a trial.
//! - HALF_OPEN: enough successes close the breaker; any failure reopens it.

use crate::clock::{elapsed_between, to_chrono, Clock};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use bulwark_error::{BulwarkError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally
    Closed,
    /// Circuit is open - requests are rejected
    Open,
    /// Circuit is half-open - testing if service recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker thresholds
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of failures before opening circuit
    pub failure_threshold: u32,
    /// Number of successes in half-open to close circuit
    pub success_threshold: u32,
    /// Time to stay open before admitting a trial call
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&EngineConfig> for BreakerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold,
            success_threshold: config.circuit_breaker_success_threshold,
            cooldown: config.breaker_cooldown(),
        }
    }
}

impl BreakerConfig {
    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set success threshold for half-open state
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// State of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    /// Resource key
    pub key: String,
    /// Current state
    pub state: CircuitState,
    /// Failures counted while CLOSED or HALF_OPEN
    pub failure_count: u32,
    /// Successes since entering HALF_OPEN
    pub success_count_in_half_open: u32,
    /// Most recent counted failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When an OPEN breaker admits a trial call
    pub next_probe_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn closed(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count_in_half_open: 0,
            last_failure_time: None,
            next_probe_time: None,
        }
    }

    fn open(&mut self, now: DateTime<Utc>, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.success_count_in_half_open = 0;
        self.next_probe_time = Some(now + to_chrono(cooldown));
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count_in_half_open = 0;
        self.next_probe_time = None;
    }
}

/// Result of asking a breaker for permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed
    Allowed,
    /// The breaker is open
    Rejected {
        /// Time until a trial call is admitted
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the call may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Outcome of an admitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call succeeded
    Success,
    /// The call failed
    Failure,
}

/// Registry of per-key breakers
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, BreakerState>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            clock,
            events,
        }
    }

    /// Breaker thresholds
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask whether a call for `key` may proceed
    ///
    /// An OPEN breaker whose cooldown has elapsed moves to HALF_OPEN and the
    /// call is admitted as a trial. HALF_OPEN admits every call, so concurrent
    /// callers all run as trials.
    pub fn guard(&self, key: &str) -> Admission {
        let now = self.clock.now();
        let mut breaker = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| BreakerState::closed(key));

        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed,
            CircuitState::Open => {
                let probe_at = breaker.next_probe_time.unwrap_or(now);
                if now >= probe_at {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.success_count_in_half_open = 0;
                    tracing::info!(key = %key, "Circuit half-open, admitting trial call");
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        retry_after: elapsed_between(now, probe_at),
                    }
                }
            }
        }
    }

    /// Like [`guard`](Self::guard), rejecting with [`BulwarkError::BreakerOpen`]
    pub fn check(&self, key: &str) -> Result<()> {
        match self.guard(key) {
            Admission::Allowed => Ok(()),
            Admission::Rejected { retry_after } => Err(BulwarkError::BreakerOpen {
                key: key.to_string(),
                retry_after,
            }),
        }
    }

    /// Record the outcome of an admitted call
    pub fn report_outcome(&self, key: &str, outcome: Outcome) {
        let now = self.clock.now();
        let event = {
            let mut breaker = self
                .breakers
                .entry(key.to_string())
                .or_insert_with(|| BreakerState::closed(key));
            self.apply(&mut breaker, outcome, now)
        };
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    fn apply(
        &self,
        breaker: &mut BreakerState,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Option<EngineEvent> {
        match (breaker.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                breaker.failure_count = breaker.failure_count.saturating_sub(1);
                None
            }
            (CircuitState::Closed, Outcome::Failure) => {
                breaker.failure_count += 1;
                breaker.last_failure_time = Some(now);
                if breaker.failure_count >= self.config.failure_threshold {
                    breaker.open(now, self.config.cooldown);
                    tracing::warn!(
                        key = %breaker.key,
                        failures = breaker.failure_count,
                        "Circuit opened due to failures"
                    );
                    Some(EngineEvent::BreakerOpened {
                        key: breaker.key.clone(),
                    })
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                breaker.success_count_in_half_open += 1;
                if breaker.success_count_in_half_open >= self.config.success_threshold {
                    breaker.close();
                    tracing::info!(key = %breaker.key, "Circuit closed after successful recovery");
                    Some(EngineEvent::BreakerClosed {
                        key: breaker.key.clone(),
                    })
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                breaker.failure_count += 1;
                breaker.last_failure_time = Some(now);
                breaker.open(now, self.config.cooldown);
                tracing::warn!(key = %breaker.key, "Circuit reopened after half-open failure");
                Some(EngineEvent::BreakerOpened {
                    key: breaker.key.clone(),
                })
            }
            // Late outcome of a call admitted before the breaker opened
            (CircuitState::Open, _) => None,
        }
    }

    /// Force `key` back to CLOSED with zeroed counters
    ///
    /// Idempotent; only a breaker that was not already CLOSED emits an event.
    pub fn reset(&self, key: &str) {
        let was_closed = match self.breakers.get_mut(key) {
            Some(mut breaker) => {
                let was_closed = breaker.state == CircuitState::Closed;
                breaker.close();
                was_closed
            }
            None => return,
        };
        if !was_closed {
            tracing::info!(key = %key, "Circuit reset");
            self.events.emit(EngineEvent::BreakerClosed {
                key: key.to_string(),
            });
        }
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for key in self.keys() {
            self.reset(&key);
        }
    }

    /// Reset OPEN breakers whose cooldown has elapsed
    ///
    /// Returns the number of breakers reset.
    pub fn reset_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| {
                b.state == CircuitState::Open && b.next_probe_time.is_some_and(|t| now >= t)
            })
            .map(|b| b.key.clone())
            .collect();

        for key in &expired {
            self.reset(key);
        }
        expired.len()
    }

    /// Snapshot of one breaker
    pub fn state(&self, key: &str) -> Option<BreakerState> {
        self.breakers.get(key).map(|b| b.value().clone())
    }

    /// Current state of `key`; unknown keys are CLOSED
    pub fn circuit_state(&self, key: &str) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of every breaker, ordered by key
    pub fn snapshot(&self) -> Vec<BreakerState> {
        let mut all: Vec<BreakerState> = self.breakers.iter().map(|b| b.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Keys whose breaker is OPEN
    pub fn open_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .map(|b| b.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of known breakers
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no breaker has been created yet
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn keys(&self) -> Vec<String> {
        self.breakers.iter().map(|b| b.key().clone()).collect()
    }
}
