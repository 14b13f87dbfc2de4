//! Retry controller
//!
//! Runs an operation up to `max_attempts` times, sleeping an exponentially
//! growing delay between attempts. Attempts are strictly sequential. While an
//! operation with an id is between attempts its progress is visible through
//! [`RetryController::active_retries`].

use crate::backoff::BackoffConfig;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::retry_policy::{AlwaysRetry, RetryClassifier};
use crate::timeout::with_optional_timeout;
use bulwark_error::BulwarkError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Progress of an operation that is between attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatus {
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    /// Rendered error of that attempt
    pub last_error: String,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

/// Per-call overrides for [`RetryController::execute_with_retry`]
pub struct RetryOptions<E> {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
    attempt_timeout: Option<Option<Duration>>,
    retry_on_timeout: bool,
    retry_if: Arc<dyn RetryClassifier<E>>,
    operation_id: Option<String>,
    cancel: Option<CancellationToken>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: None,
            multiplier: None,
            jitter: None,
            attempt_timeout: None,
            retry_on_timeout: true,
            retry_if: Arc::new(AlwaysRetry),
            operation_id: None,
            cancel: None,
        }
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
            attempt_timeout: self.attempt_timeout,
            retry_on_timeout: self.retry_on_timeout,
            retry_if: Arc::clone(&self.retry_if),
            operation_id: self.operation_id.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("operation_id", &self.operation_id)
            .finish_non_exhaustive()
    }
}

impl<E> RetryOptions<E> {
    /// Options that defer to the controller's configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the attempt limit
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Override the backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Override the per-attempt timeout; `None` disables it
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Whether a timed-out attempt may be retried
    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Decide per error whether to try again
    pub fn with_retry_if(mut self, classifier: impl RetryClassifier<E> + 'static) -> Self {
        self.retry_if = Arc::new(classifier);
        self
    }

    /// Share an existing classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier<E>>) -> Self {
        self.retry_if = classifier;
        self
    }

    /// Track progress under `id`
    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    /// Stop before the next attempt once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Failure of a single attempt
#[derive(Debug)]
pub enum AttemptError<E> {
    /// The operation returned an error
    Failed(E),
    /// The attempt exceeded its timeout
    TimedOut(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{}", e),
            Self::TimedOut(d) => write!(f, "attempt timed out after {:?}", d),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AttemptError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(e) => Some(e),
            Self::TimedOut(_) => None,
        }
    }
}

/// Error when an operation did not succeed
#[derive(Debug)]
pub enum RetryError<E> {
    /// The final attempt failed or the classifier declined to retry
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error of the final attempt
        last_error: AttemptError<E>,
    },
    /// Cancelled before the next attempt
    Cancelled {
        /// Number of attempts made
        attempts: u32,
        /// Error of the last attempt, if any ran
        last_error: Option<AttemptError<E>>,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Error of the last attempt, if any ran
    pub fn last_error(&self) -> Option<&AttemptError<E>> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }

    /// The operation's own error from the last attempt
    pub fn into_inner(self) -> Option<E> {
        let last = match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Cancelled { last_error, .. } => last_error,
        };
        match last {
            Some(AttemptError::Failed(e)) => Some(e),
            _ => None,
        }
    }

    /// Whether the caller cancelled the operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "All {} attempts exhausted; last error: {}",
                attempts, last_error
            ),
            Self::Cancelled { attempts, .. } => {
                write!(f, "Operation cancelled after {} attempt(s)", attempts)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_error().map(|e| e as _)
    }
}

impl<E> From<RetryError<E>> for BulwarkError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => {
                let last_cause: bulwark_error::BoxError = match last_error {
                    AttemptError::Failed(e) => Box::new(BulwarkError::operation(e)),
                    AttemptError::TimedOut(timeout) => Box::new(BulwarkError::AttemptTimedOut {
                        attempt: attempts,
                        timeout,
                    }),
                };
                BulwarkError::AllAttemptsExhausted {
                    attempts,
                    last_cause,
                }
            }
            RetryError::Cancelled { attempts, .. } => BulwarkError::Cancelled { attempts },
        }
    }
}

/// Executes operations with bounded retries
#[derive(Debug, Clone)]
pub struct RetryController {
    backoff: BackoffConfig,
    attempt_timeout: Option<Duration>,
    active: Arc<DashMap<String, RetryStatus>>,
    clock: Arc<dyn Clock>,
}

impl RetryController {
    /// Create a controller with explicit defaults
    pub fn new(
        backoff: BackoffConfig,
        attempt_timeout: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backoff,
            attempt_timeout,
            active: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Create a controller from engine configuration
    pub fn from_config(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(BackoffConfig::from(config), config.attempt_timeout(), clock)
    }

    /// Default backoff settings
    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// Default per-attempt timeout
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Run `operation` until it succeeds or retries are exhausted
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        mut operation: F,
        options: RetryOptions<E>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let backoff = self.effective_backoff(&options);
        let max_attempts = backoff.max_attempts.max(1);
        let attempt_timeout = options.attempt_timeout.unwrap_or(self.attempt_timeout);
        let op_id = options.operation_id.as_deref();

        let mut attempt = 0;
        let mut last_error: Option<AttemptError<E>> = None;

        loop {
            if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                self.untrack(op_id);
                tracing::debug!(attempts = attempt, "Operation cancelled");
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last_error,
                });
            }

            attempt += 1;
            let outcome = with_optional_timeout(attempt_timeout, "attempt", operation(attempt))
                .await
                .map_err(|e| AttemptError::TimedOut(e.duration))
                .and_then(|r| r.map_err(AttemptError::Failed));

            let err = match outcome {
                Ok(value) => {
                    self.untrack(op_id);
                    if attempt > 1 {
                        tracing::debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retryable = match &err {
                AttemptError::Failed(e) => options.retry_if.should_retry(e, attempt),
                AttemptError::TimedOut(_) => options.retry_on_timeout,
            };

            if attempt >= max_attempts || !retryable {
                self.untrack(op_id);
                tracing::debug!(
                    attempts = attempt,
                    retryable,
                    error = %err,
                    "Giving up on operation"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let mut delay = backoff.delay_for(attempt);
            if let AttemptError::Failed(e) = &err {
                if let Some(hint) = options.retry_if.suggested_delay(e) {
                    delay = delay.max(hint);
                }
            }

            tracing::debug!(
                attempt,
                remaining = max_attempts - attempt,
                delay = ?delay,
                error = %err,
                "Attempt failed, will retry"
            );
            self.track(op_id, attempt, &err);
            last_error = Some(err);

            match options.cancel.as_ref() {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Snapshot of operations currently between attempts
    pub fn active_retries(&self) -> Vec<(String, RetryStatus)> {
        self.active
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Progress of one tracked operation
    pub fn status(&self, operation_id: &str) -> Option<RetryStatus> {
        self.active.get(operation_id).map(|s| s.value().clone())
    }

    fn effective_backoff<E>(&self, options: &RetryOptions<E>) -> BackoffConfig {
        let mut backoff = self.backoff.clone();
        if let Some(attempts) = options.max_attempts {
            backoff.max_attempts = attempts;
        }
        if let Some(delay) = options.base_delay {
            backoff.base_delay = delay;
        }
        if let Some(multiplier) = options.multiplier {
            backoff.multiplier = multiplier;
        }
        match options.jitter {
            Some(false) => backoff.jitter_fraction = 0.0,
            Some(true) if backoff.jitter_fraction <= 0.0 => {
                backoff.jitter_fraction = crate::backoff::DEFAULT_JITTER_FRACTION
            }
            _ => {}
        }
        backoff
    }

    fn track<E: std::fmt::Display>(&self, op_id: Option<&str>, attempt: u32, err: &AttemptError<E>) {
        if let Some(id) = op_id {
            self.active.insert(
                id.to_string(),
                RetryStatus {
                    attempt,
                    last_error: err.to_string(),
                    timestamp: self.clock.now(),
                },
            );
        }
    }

    fn untrack(&self, op_id: Option<&str>) {
        if let Some(id) = op_id {
            self.active.remove(id);
        }
    }
}
