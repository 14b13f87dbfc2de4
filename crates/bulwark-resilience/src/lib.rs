//! # Bulwark Resilience
//!
//! Resilience engine for unreliable operations such as remote API calls.
//!
//! Every request runs through the same pipeline:
//!
//! - **Cache**: fresh values are served without calling the operation; a
//!   durable tier keeps stale copies across restarts
//! - **Circuit Breaker**: per-resource isolation that stops calling a failing
//!   dependency until a cooldown elapses
//! - **Retry**: exponential backoff with jitter, per-attempt timeouts and a
//!   pluggable retry classifier
//! - **Fallback**: a stale cached value, or a declared degraded value
//!
//! Alongside the pipeline, a health monitor runs probes on an interval and a
//! recovery orchestrator dispatches unhealthy components to recovery actions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bulwark_resilience::{EngineConfig, RequestOptions, ResilienceEngine, Source};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ResilienceEngine::new(EngineConfig::default()).await?;
//! engine.start().await;
//!
//! let price = engine
//!     .request(
//!         "prices",
//!         |_attempt| async { Ok::<_, std::io::Error>(42.0_f64) },
//!         RequestOptions::new().with_fallback(0.0),
//!     )
//!     .await;
//!
//! if price.source == Source::Degraded {
//!     println!("serving fallback: {:?}", price.reason);
//! }
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use bulwark_resilience::{BreakerConfig, BreakerRegistry, CircuitState, EventBus, Outcome, SystemClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let breakers = BreakerRegistry::new(
//!     BreakerConfig::default()
//!         .with_failure_threshold(2)
//!         .with_cooldown(Duration::from_secs(30)),
//!     Arc::new(SystemClock),
//!     EventBus::default(),
//! );
//!
//! breakers.report_outcome("rpc", Outcome::Failure);
//! breakers.report_outcome("rpc", Outcome::Failure);
//! assert_eq!(breakers.circuit_state("rpc"), CircuitState::Open);
//! assert!(!breakers.guard("rpc").is_allowed());
//! ```
//!
//! ## Retry Policies
//!
//! ```rust
//! use bulwark_resilience::{DefaultRetryClassifier, HttpRetryClassifier};
//!
//! assert!(HttpRetryClassifier::is_status_retryable(503));
//! assert!(HttpRetryClassifier::is_status_retryable(429));
//! assert!(!HttpRetryClassifier::is_status_retryable(404));
//!
//! assert!(DefaultRetryClassifier::is_message_retryable("connection reset"));
//! assert!(!DefaultRetryClassifier::is_message_retryable("401 Unauthorized"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod durable;
pub mod engine;
pub mod events;
pub mod health;
pub mod latency;
pub mod pipeline;
pub mod recovery;
pub mod retry;
pub mod retry_policy;
pub mod timeout;

pub use backoff::BackoffConfig;

pub use cache::{CacheConfig, CacheEntry, CacheStats, CacheStore};

pub use circuit_breaker::{
    Admission, BreakerConfig, BreakerRegistry, BreakerState, CircuitState, Outcome,
};

pub use clock::{Clock, ManualClock, SystemClock};

pub use config::{ConfigRepair, EngineConfig};

pub use durable::{DurableTier, FileDurableTier, MemoryDurableTier};

pub use engine::{endpoint_component, ResilienceEngine, ResilienceEngineBuilder};

pub use events::{EngineEvent, EventBus};

pub use health::{
    probe_fn, ComponentStatus, HealthMonitor, HealthReport, HealthStatus, Probe, ProbeResult,
};

pub use latency::LatencyTracker;

pub use pipeline::{FallbackReason, Fetched, RequestOptions, RequestPipeline, Source};

pub use recovery::{recovery_fn, RecoveryAction, RecoveryOrchestrator, RecoverySummary};

pub use retry::{AttemptError, RetryController, RetryError, RetryOptions, RetryStatus};

pub use retry_policy::{
    AlwaysRetry, DefaultRetryClassifier, HttpRetryClassifier, HttpStatusError, RetryClassifier,
};

pub use timeout::{with_optional_timeout, with_timeout, TimeoutError};

pub use bulwark_error::{BulwarkError, ErrorCode, Result};
