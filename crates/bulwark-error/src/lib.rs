//! # Bulwark Error
//!
//! Unified error types for the Bulwark resilience engine.
//!
//! Most failures inside the engine are absorbed: they are logged, reflected in
//! health state, and turned into fallback results. The variants here are what
//! remains visible to code that talks to the engine's components directly.
//!
//! ## Error Categories
//!
//! - Operation errors: [`BulwarkError::OperationFailed`],
//!   [`BulwarkError::AllAttemptsExhausted`], [`BulwarkError::Cancelled`],
//!   [`BulwarkError::AttemptTimedOut`]
//! - Isolation errors: [`BulwarkError::BreakerOpen`]
//! - Storage errors: [`BulwarkError::StorageUnavailable`], [`BulwarkError::CorruptRecord`]
//! - Health errors: [`BulwarkError::ProbeThrew`], [`BulwarkError::RecoveryFailed`]
//! - Startup errors: [`BulwarkError::InvalidConfig`]
//!
//! ## Example
//!
//! ```
//! use bulwark_error::{BulwarkError, ErrorCode, Result};
//! use std::time::Duration;
//!
//! fn gate(open: bool) -> Result<()> {
//!     if open {
//!         return Err(BulwarkError::BreakerOpen {
//!             key: "https://api.example.com/videos".to_string(),
//!             retry_after: Duration::from_secs(30),
//!         });
//!     }
//!     Ok(())
//! }
//!
//! let err = gate(true).unwrap_err();
//! assert_eq!(err.code(), ErrorCode::BreakerOpen);
//! assert!(!err.is_retryable());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;
use thiserror::Error;

/// Boxed error used to carry an operation's underlying cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    // ============ Operation Errors ============
    /// The wrapped operation failed
    #[error("Operation failed: {0}")]
    OperationFailed(#[source] BoxError),

    /// Every allowed attempt failed, or the retry predicate declined
    #[error("All {attempts} attempts exhausted; last error: {last_cause}")]
    AllAttemptsExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        last_cause: BoxError,
    },

    /// The caller cancelled the operation between attempts
    #[error("Operation cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Number of attempts made before cancellation
        attempts: u32,
    },

    /// A single attempt exceeded its timeout
    #[error("Attempt {attempt} timed out after {timeout:?}")]
    AttemptTimedOut {
        /// Attempt number (1-based)
        attempt: u32,
        /// Timeout that was exceeded
        timeout: Duration,
    },

    // ============ Isolation Errors ============
    /// Short-circuited by an open breaker; never counted as a new failure
    #[error("Circuit '{key}' is open, retry after {retry_after:?}")]
    BreakerOpen {
        /// Resource key of the breaker
        key: String,
        /// Time until the breaker admits a trial call
        retry_after: Duration,
    },

    // ============ Storage Errors ============
    /// The durable cache tier could not be reached
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A durable record could not be decoded
    #[error("Corrupt record '{key}': {reason}")]
    CorruptRecord {
        /// Storage key of the record
        key: String,
        /// Decode failure
        reason: String,
    },

    // ============ Health Errors ============
    /// A health probe failed, timed out or panicked
    #[error("Probe '{name}' failed: {cause}")]
    ProbeThrew {
        /// Probe name
        name: String,
        /// Failure description
        cause: String,
    },

    /// A recovery action failed
    #[error("Recovery of '{component}' failed: {reason}")]
    RecoveryFailed {
        /// Component the action was registered for
        component: String,
        /// Failure description
        reason: String,
    },

    // ============ Startup Errors ============
    /// Configuration is malformed and cannot be repaired
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ============ IO Errors ============
    /// File IO error
    #[error("IO error: {0}")]
    Io(String),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(String),

    // ============ Generic ============
    /// Unknown/other error
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type using BulwarkError
pub type Result<T> = std::result::Result<T, BulwarkError>;

impl From<std::io::Error> for BulwarkError {
    fn from(err: std::io::Error) -> Self {
        BulwarkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BulwarkError {
    fn from(err: serde_json::Error) -> Self {
        BulwarkError::Json(err.to_string())
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Operation failed
    OperationFailed = 1001,
    /// All attempts exhausted
    AllAttemptsExhausted = 1002,
    /// Cancelled
    Cancelled = 1003,
    /// Attempt timed out
    AttemptTimedOut = 1004,
    /// Breaker open
    BreakerOpen = 2001,
    /// Storage unavailable
    StorageUnavailable = 3001,
    /// Corrupt record
    CorruptRecord = 3002,
    /// Probe failed
    ProbeThrew = 4001,
    /// Recovery failed
    RecoveryFailed = 4002,
    /// Invalid configuration
    InvalidConfig = 5001,
    /// IO error
    Io = 6001,
    /// JSON error
    Json = 6002,
}

impl BulwarkError {
    /// Wraps an arbitrary error as [`BulwarkError::OperationFailed`]
    pub fn operation(err: impl Into<BoxError>) -> Self {
        BulwarkError::OperationFailed(err.into())
    }

    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            BulwarkError::OperationFailed(_) => ErrorCode::OperationFailed,
            BulwarkError::AllAttemptsExhausted { .. } => ErrorCode::AllAttemptsExhausted,
            BulwarkError::Cancelled { .. } => ErrorCode::Cancelled,
            BulwarkError::AttemptTimedOut { .. } => ErrorCode::AttemptTimedOut,
            BulwarkError::BreakerOpen { .. } => ErrorCode::BreakerOpen,
            BulwarkError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            BulwarkError::CorruptRecord { .. } => ErrorCode::CorruptRecord,
            BulwarkError::ProbeThrew { .. } => ErrorCode::ProbeThrew,
            BulwarkError::RecoveryFailed { .. } => ErrorCode::RecoveryFailed,
            BulwarkError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            BulwarkError::Io(_) => ErrorCode::Io,
            BulwarkError::Json(_) => ErrorCode::Json,
            BulwarkError::Other(_) => ErrorCode::Unknown,
        }
    }

    /// Returns true if another attempt could reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BulwarkError::OperationFailed(_)
                | BulwarkError::AttemptTimedOut { .. }
                | BulwarkError::StorageUnavailable(_)
                | BulwarkError::Io(_)
        )
    }

    /// Returns true for conditions that must surface as hard failures
    pub fn is_fatal(&self) -> bool {
        matches!(self, BulwarkError::InvalidConfig(_))
    }

    /// Returns the suggested wait before trying again, if known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BulwarkError::BreakerOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BulwarkError::BreakerOpen {
            key: "videos".to_string(),
            retry_after: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("videos"));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_error_code() {
        let err = BulwarkError::StorageUnavailable("disk full".into());
        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert_eq!(ErrorCode::BreakerOpen as u32, 2001);
    }

    #[test]
    fn test_exhausted_keeps_source() {
        use std::error::Error as _;

        let err = BulwarkError::AllAttemptsExhausted {
            attempts: 3,
            last_cause: "503 service unavailable".into(),
        };
        assert!(err.to_string().contains("All 3 attempts"));
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some("503 service unavailable".to_string())
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BulwarkError::operation("connection reset").is_retryable());
        assert!(BulwarkError::AttemptTimedOut {
            attempt: 1,
            timeout: Duration::from_secs(1),
        }
        .is_retryable());

        let open = BulwarkError::BreakerOpen {
            key: "k".into(),
            retry_after: Duration::from_secs(10),
        };
        assert!(!open.is_retryable());
        assert_eq!(open.retry_after(), Some(Duration::from_secs(10)));

        let cancelled = BulwarkError::Cancelled { attempts: 1 };
        assert!(!cancelled.is_retryable());
        assert_eq!(cancelled.retry_after(), None);
    }

    #[test]
    fn test_only_config_is_fatal() {
        assert!(BulwarkError::InvalidConfig("ttl".into()).is_fatal());
        assert!(!BulwarkError::ProbeThrew {
            name: "api".into(),
            cause: "boom".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_from_json_error() {
        let parse: std::result::Result<u32, _> = serde_json::from_str::<u32>("not json");
        let err: BulwarkError = parse.unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::Json);
    }
}
