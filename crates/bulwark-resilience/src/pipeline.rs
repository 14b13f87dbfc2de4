//! Request pipeline
//!
//! The primary entry point: cache lookup, breaker gate, retried operation,
//! cache write. A request never fails; when the operation cannot produce a
//! value the caller gets a stale cache entry or a declared fallback, tagged
//! so good, stale and degraded data can be told apart.

use crate::cache::CacheStore;
use crate::circuit_breaker::{Admission, BreakerRegistry, CircuitState, Outcome};
use crate::latency::LatencyTracker;
use crate::retry::{AttemptError, RetryController, RetryError, RetryOptions};
use crate::retry_policy::{DefaultRetryClassifier, RetryClassifier};
use crate::timeout::with_optional_timeout;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a returned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Produced by the operation during this request
    Live,
    /// Fresh cache entry
    Cache,
    /// Expired cache entry served as a fallback
    Stale,
    /// Declared fallback value
    Degraded,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Cache => write!(f, "cache"),
            Self::Stale => write!(f, "stale"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Why a request fell back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackReason {
    /// The breaker rejected the call
    BreakerOpen,
    /// Every allowed attempt failed
    Exhausted,
    /// The caller cancelled the request
    Cancelled,
}

/// Result of a pipeline request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fetched<T> {
    /// The value handed to the caller
    pub value: T,
    /// Where the value came from
    pub source: Source,
    /// Why the request fell back, if it did
    pub reason: Option<FallbackReason>,
    /// Attempts made; zero for cache hits and rejected calls
    pub attempts: u32,
    /// Rendered error of the last failed attempt
    pub last_error: Option<String>,
}

impl<T> Fetched<T> {
    fn new(value: T, source: Source, attempts: u32) -> Self {
        Self {
            value,
            source,
            reason: None,
            attempts,
            last_error: None,
        }
    }

    /// Whether the value is current (live or fresh cache)
    pub fn is_fresh(&self) -> bool {
        matches!(self.source, Source::Live | Source::Cache)
    }

    /// Whether the value is the declared fallback
    pub fn is_degraded(&self) -> bool {
        self.source == Source::Degraded
    }
}

/// Per-request options
pub struct RequestOptions<T, E> {
    cache_key: Option<String>,
    ttl: Option<Duration>,
    use_cache: bool,
    fallback: Option<T>,
    retry_if: Option<Arc<dyn RetryClassifier<E>>>,
    max_attempts: Option<u32>,
    attempt_timeout: Option<Option<Duration>>,
    operation_id: Option<String>,
    cancel: Option<CancellationToken>,
}

impl<T, E> Default for RequestOptions<T, E> {
    fn default() -> Self {
        Self {
            cache_key: None,
            ttl: None,
            use_cache: true,
            fallback: None,
            retry_if: None,
            max_attempts: None,
            attempt_timeout: None,
            operation_id: None,
            cancel: None,
        }
    }
}

impl<T, E> RequestOptions<T, E> {
    /// Defaults: cache on, configured retries, `T::default()` fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache under `key` instead of the resource key
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// TTL for the cached result
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Skip cache reads, writes and stale fallbacks
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Value returned when nothing better is available
    pub fn with_fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    /// Decide per error whether to retry
    ///
    /// Errors this classifier declines are final. They still count as
    /// breaker failures.
    pub fn with_retry_if(mut self, classifier: impl RetryClassifier<E> + 'static) -> Self {
        self.retry_if = Some(Arc::new(classifier));
        self
    }

    /// Override the attempt limit
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the per-attempt timeout; `None` disables it
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Track retries under `id`
    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    /// Stop retrying once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Failure of one pipeline attempt
#[derive(Debug)]
enum AttemptFailure<E> {
    /// The breaker opened between attempts
    Rejected,
    /// The operation failed
    Failed { error: E, retryable: bool },
    /// The operation exceeded the attempt timeout
    TimedOut(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "circuit open"),
            Self::Failed { error, .. } => write!(f, "{}", error),
            Self::TimedOut(d) => write!(f, "attempt timed out after {:?}", d),
        }
    }
}

/// Retry gate over attempt failures, deferring to the caller's classifier
///
/// A retry the breaker would reject is refused here, before the backoff
/// sleep, and recorded in `tripped`.
struct AttemptGate<E> {
    inner: Arc<dyn RetryClassifier<E>>,
    breakers: Arc<BreakerRegistry>,
    key: String,
    max_attempts: u32,
    tripped: Arc<AtomicBool>,
}

impl<E> RetryClassifier<AttemptFailure<E>> for AttemptGate<E> {
    fn should_retry(&self, failure: &AttemptFailure<E>, attempt: u32) -> bool {
        let wants_retry = match failure {
            AttemptFailure::Rejected => false,
            AttemptFailure::Failed { retryable, .. } => *retryable,
            AttemptFailure::TimedOut(_) => true,
        };
        if wants_retry
            && attempt < self.max_attempts
            && self.breakers.circuit_state(&self.key) == CircuitState::Open
        {
            self.tripped.store(true, Ordering::SeqCst);
            return false;
        }
        wants_retry
    }

    fn suggested_delay(&self, failure: &AttemptFailure<E>) -> Option<Duration> {
        match failure {
            AttemptFailure::Failed { error, .. } => self.inner.suggested_delay(error),
            _ => None,
        }
    }
}

/// Cache, breaker and retry around one fallible operation
#[derive(Debug, Clone)]
pub struct RequestPipeline {
    cache: Arc<CacheStore<serde_json::Value>>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryController,
    latency: Arc<LatencyTracker>,
}

impl RequestPipeline {
    /// Assemble a pipeline from shared components
    pub fn new(
        cache: Arc<CacheStore<serde_json::Value>>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryController,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        Self {
            cache,
            breakers,
            retry,
            latency,
        }
    }

    /// Shared cache
    pub fn cache(&self) -> &Arc<CacheStore<serde_json::Value>> {
        &self.cache
    }

    /// Shared breaker registry
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Retry controller
    pub fn retry(&self) -> &RetryController {
        &self.retry
    }

    /// Latency averages per resource key
    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }

    /// Run `operation` for `resource_key` with caching, isolation and retry
    ///
    /// The breaker is consulted before every attempt and told the outcome of
    /// every attempt. A success is cached under the cache key.
    pub async fn request<T, E, F, Fut>(
        &self,
        resource_key: &str,
        mut operation: F,
        options: RequestOptions<T, E>,
    ) -> Fetched<T>
    where
        T: Serialize + DeserializeOwned + Default,
        E: std::fmt::Display + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let RequestOptions {
            cache_key,
            ttl,
            use_cache,
            fallback,
            retry_if,
            max_attempts,
            attempt_timeout,
            operation_id,
            cancel,
        } = options;
        let cache_key = cache_key.unwrap_or_else(|| resource_key.to_string());

        if use_cache {
            if let Some(value) = self.cached::<T>(&cache_key) {
                tracing::trace!(key = %resource_key, "Fresh cache hit");
                return Fetched::new(value, Source::Cache, 0);
            }
        }

        if let Admission::Rejected { retry_after } = self.breakers.guard(resource_key) {
            tracing::debug!(key = %resource_key, retry_after = ?retry_after, "Circuit open, skipping operation");
            return self
                .fallback(&cache_key, use_cache, fallback, FallbackReason::BreakerOpen, 0, None)
                .await;
        }

        let classifier: Arc<dyn RetryClassifier<E>> = match retry_if {
            Some(classifier) => classifier,
            None => Arc::new(DefaultRetryClassifier),
        };
        let attempt_timeout = attempt_timeout.unwrap_or(self.retry.attempt_timeout());

        let max_attempts = max_attempts
            .unwrap_or(self.retry.backoff().max_attempts)
            .max(1);
        let tripped = Arc::new(AtomicBool::new(false));

        // attempt timeouts are applied below so they reach the breaker
        let gate: Arc<dyn RetryClassifier<AttemptFailure<E>>> = Arc::new(AttemptGate {
            inner: Arc::clone(&classifier),
            breakers: Arc::clone(&self.breakers),
            key: resource_key.to_string(),
            max_attempts,
            tripped: Arc::clone(&tripped),
        });
        let mut retry_options = RetryOptions::new()
            .with_attempt_timeout(None)
            .with_classifier(gate);
        retry_options = retry_options.with_max_attempts(max_attempts);
        if let Some(id) = operation_id {
            retry_options = retry_options.with_operation_id(id);
        }
        if let Some(token) = cancel {
            retry_options = retry_options.with_cancellation(token);
        }

        let breakers = &self.breakers;
        let latency = &self.latency;
        let mut attempts_made = 0;
        let result = self
            .retry
            .execute_with_retry(
                |attempt| {
                    attempts_made = attempt;
                    // the first attempt was admitted above
                    let admitted = attempt == 1 || breakers.guard(resource_key).is_allowed();
                    let call = admitted.then(|| operation(attempt));
                    let classifier = Arc::clone(&classifier);
                    async move {
                        let Some(call) = call else {
                            return Err(AttemptFailure::Rejected);
                        };
                        let started = Instant::now();
                        let outcome = with_optional_timeout(attempt_timeout, "attempt", call).await;
                        latency.record(resource_key, started.elapsed());

                        match outcome {
                            Ok(Ok(value)) => {
                                breakers.report_outcome(resource_key, Outcome::Success);
                                Ok(value)
                            }
                            Ok(Err(error)) => {
                                let retryable = classifier.should_retry(&error, attempt);
                                breakers.report_outcome(resource_key, Outcome::Failure);
                                Err(AttemptFailure::Failed { error, retryable })
                            }
                            Err(timeout) => {
                                breakers.report_outcome(resource_key, Outcome::Failure);
                                Err(AttemptFailure::TimedOut(timeout.duration))
                            }
                        }
                    }
                },
                retry_options,
            )
            .await;

        match result {
            Ok(value) => {
                if use_cache {
                    self.store(&cache_key, &value, ttl).await;
                }
                Fetched::new(value, Source::Live, attempts_made)
            }
            Err(err) => {
                let last_error = err.last_error().map(|e| e.to_string());
                let (reason, attempts) = match &err {
                    RetryError::Cancelled { attempts, .. } => (FallbackReason::Cancelled, *attempts),
                    RetryError::Exhausted { attempts, .. } if tripped.load(Ordering::SeqCst) => {
                        (FallbackReason::BreakerOpen, *attempts)
                    }
                    // the rejected attempt never ran
                    RetryError::Exhausted {
                        attempts,
                        last_error: AttemptError::Failed(AttemptFailure::Rejected),
                    } => (FallbackReason::BreakerOpen, attempts.saturating_sub(1)),
                    RetryError::Exhausted { attempts, .. } => (FallbackReason::Exhausted, *attempts),
                };
                tracing::warn!(
                    key = %resource_key,
                    attempts,
                    reason = ?reason,
                    error = last_error.as_deref().unwrap_or(""),
                    "Request failed, falling back"
                );
                self.fallback(&cache_key, use_cache, fallback, reason, attempts, last_error)
                    .await
            }
        }
    }

    fn cached<T: DeserializeOwned>(&self, cache_key: &str) -> Option<T> {
        let value = self.cache.peek(cache_key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(key = %cache_key, error = %e, "Cached value has a different shape, treating as miss");
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, cache_key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_value(value) {
            Ok(json) => self.cache.set(cache_key, json, ttl).await,
            Err(e) => tracing::warn!(key = %cache_key, error = %e, "Result not cacheable"),
        }
    }

    async fn fallback<T: DeserializeOwned + Default>(
        &self,
        cache_key: &str,
        use_cache: bool,
        fallback: Option<T>,
        reason: FallbackReason,
        attempts: u32,
        last_error: Option<String>,
    ) -> Fetched<T> {
        if use_cache {
            if let Some(stale) = self.cache.get_allow_stale(cache_key).await {
                match serde_json::from_value::<T>(stale) {
                    Ok(value) => {
                        return Fetched {
                            value,
                            source: Source::Stale,
                            reason: Some(reason),
                            attempts,
                            last_error,
                        }
                    }
                    Err(e) => {
                        tracing::debug!(key = %cache_key, error = %e, "Stale value has a different shape");
                    }
                }
            }
        }

        Fetched {
            value: fallback.unwrap_or_default(),
            source: Source::Degraded,
            reason: Some(reason),
            attempts,
            last_error,
        }
    }
}
