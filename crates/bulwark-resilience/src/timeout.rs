//! Timeout helpers for attempts and probes

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Timeout error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Operation '{operation}' timed out after {duration:?}")]
pub struct TimeoutError {
    /// The operation that timed out
    pub operation: String,
    /// The timeout duration
    pub duration: Duration,
}

/// Execute a future with a timeout
pub async fn with_timeout<T>(
    duration: Duration,
    operation: impl Into<String>,
    future: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    let op = operation.into();
    timeout(duration, future).await.map_err(|_| TimeoutError {
        operation: op,
        duration,
    })
}

/// Execute with a timeout only when one is configured
pub async fn with_optional_timeout<T>(
    duration: Option<Duration>,
    operation: impl Into<String>,
    future: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    match duration {
        Some(d) => with_timeout(d, operation, future).await,
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), "test", async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expired() {
        let result = with_timeout(Duration::from_millis(10), "slow_op", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.operation, "slow_op");
        assert_eq!(err.duration, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_timeout_disabled() {
        let result = with_optional_timeout(None, "unbounded", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            7
        })
        .await;
        assert_eq!(result, Ok(7));
    }
}
