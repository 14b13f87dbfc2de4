//! Retry policies for different error types
//!
//! Determines which errors should trigger another attempt. Any
//! `Fn(&E, u32) -> bool` closure is a classifier, receiving the error and the
//! 1-based attempt that produced it.

use std::time::Duration;

/// Trait for classifying errors as retryable or not
pub trait RetryClassifier<E>: Send + Sync {
    /// Whether the failure of `attempt` should be followed by another attempt
    fn should_retry(&self, error: &E, attempt: u32) -> bool;

    /// Minimum delay before the next attempt, if the error asks for one
    fn suggested_delay(&self, _error: &E) -> Option<Duration> {
        None
    }
}

impl<E, F> RetryClassifier<E> for F
where
    F: Fn(&E, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &E, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Retries every error
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E> RetryClassifier<E> for AlwaysRetry {
    fn should_retry(&self, _error: &E, _attempt: u32) -> bool {
        true
    }
}

/// Message-based classifier
///
/// Client errors (bad request, auth, not found, validation) are final;
/// everything else is assumed transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryClassifier;

impl DefaultRetryClassifier {
    /// Whether an error message describes a transient condition
    ///
    /// A status code decides on its own when one leads the message or
    /// follows `HTTP`, `status` or `code`. Other digits (ids, durations) are
    /// ignored.
    pub fn is_message_retryable(message: &str) -> bool {
        let msg = message.to_lowercase();

        if let Some(status) = status_in(&msg) {
            return !HttpRetryClassifier::is_client_error(status);
        }

        if msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("rate limit")
            || msg.contains("too many requests")
            || msg.contains("temporar")
            || msg.contains("try again")
        {
            return true;
        }

        let client_error = msg.contains("bad request")
            || msg.contains("unauthorized")
            || msg.contains("forbidden")
            || msg.contains("not found")
            || msg.contains("malformed");

        !client_error
    }
}

/// HTTP status named by a lowercased message, if any
fn status_in(msg: &str) -> Option<u16> {
    let tokens: Vec<&str> = msg
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    tokens.iter().enumerate().find_map(|(i, token)| {
        if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let status: u16 = token.parse().ok()?;
        if !(100..600).contains(&status) {
            return None;
        }
        let introduced = tokens[i.saturating_sub(3)..i]
            .iter()
            .any(|t| matches!(*t, "http" | "status" | "code"));
        (i == 0 || introduced).then_some(status)
    })
}

impl<E: std::fmt::Display> RetryClassifier<E> for DefaultRetryClassifier {
    fn should_retry(&self, error: &E, _attempt: u32) -> bool {
        Self::is_message_retryable(&error.to_string())
    }

    fn suggested_delay(&self, error: &E) -> Option<Duration> {
        let msg = error.to_string().to_lowercase();

        // Rate limiting usually needs longer delays
        if status_in(&msg) == Some(429)
            || msg.contains("rate limit")
            || msg.contains("too many requests")
        {
            return Some(Duration::from_secs(5));
        }

        None
    }
}

/// Errors that may carry an HTTP status
pub trait HttpStatusError {
    /// Response status; `None` for transport failures
    fn status(&self) -> Option<u16>;

    /// Parsed `Retry-After`, when the server sent one
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// HTTP-specific retry classifier
///
/// Transport failures and server errors are retried. 4xx responses are
/// final except 408, 425 and 429.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpRetryClassifier;

impl HttpRetryClassifier {
    /// Check if HTTP status code is retryable
    pub fn is_status_retryable(status: u16) -> bool {
        matches!(
            status,
            408 | // Request Timeout
            425 | // Too Early
            429 | // Too Many Requests
            500 | // Internal Server Error
            502 | // Bad Gateway
            503 | // Service Unavailable
            504   // Gateway Timeout
        )
    }

    /// Check if status is a client error that must not be retried
    pub fn is_client_error(status: u16) -> bool {
        (400..500).contains(&status) && !Self::is_status_retryable(status)
    }

    /// Check if status indicates rate limiting
    pub fn is_rate_limited(status: u16) -> bool {
        status == 429
    }

    /// Get retry delay from Retry-After header value
    pub fn parse_retry_after(value: &str) -> Option<Duration> {
        if let Ok(secs) = value.trim().parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }

        let date = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
        let wait = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
        Some(wait.to_std().unwrap_or(Duration::ZERO))
    }
}

impl<E: HttpStatusError> RetryClassifier<E> for HttpRetryClassifier {
    fn should_retry(&self, error: &E, _attempt: u32) -> bool {
        match error.status() {
            None => true,
            Some(status) => !Self::is_client_error(status),
        }
    }

    fn suggested_delay(&self, error: &E) -> Option<Duration> {
        error.retry_after()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    struct Status(Option<u16>);

    impl HttpStatusError for Status {
        fn status(&self) -> Option<u16> {
            self.0
        }
    }

    fn err(msg: &str) -> TestError {
        TestError(msg.to_string())
    }

    #[test]
    fn test_default_classifier_transient() {
        let classifier = DefaultRetryClassifier;
        assert!(classifier.should_retry(&err("connection reset by peer"), 1));
        assert!(classifier.should_retry(&err("request timed out"), 1));
        assert!(classifier.should_retry(&err("503 service unavailable"), 1));
        assert!(classifier.should_retry(&err("429 too many requests"), 1));
    }

    #[test]
    fn test_default_classifier_client_errors() {
        let classifier = DefaultRetryClassifier;
        assert!(!classifier.should_retry(&err("404 not found"), 1));
        assert!(!classifier.should_retry(&err("401 Unauthorized"), 1));
        assert!(!classifier.should_retry(&err("HTTP 404 from https://api.example.com"), 1));
        assert!(!classifier.should_retry(&err("request failed: status 422"), 1));
    }

    #[test]
    fn test_default_classifier_ignores_incidental_digits() {
        let classifier = DefaultRetryClassifier;
        assert!(classifier.should_retry(&err("503 Service Unavailable (request id 84041)"), 1));
        assert!(classifier.should_retry(&err("connection reset after 4001ms"), 1));
        assert!(classifier.should_retry(&err("upstream sent invalid gateway response"), 1));
        assert!(classifier.should_retry(&err("order 404 could not be priced: upstream down"), 1));
        assert!(classifier.should_retry(&err("HTTP/1.1 502 Bad Gateway"), 1));
    }

    #[test]
    fn test_default_classifier_rate_limit_delay() {
        let classifier = DefaultRetryClassifier;
        let delay = classifier.suggested_delay(&err("rate limit exceeded"));
        assert_eq!(delay, Some(Duration::from_secs(5)));
        let delay = classifier.suggested_delay(&err("HTTP 429"));
        assert_eq!(delay, Some(Duration::from_secs(5)));
        assert!(RetryClassifier::<TestError>::suggested_delay(&classifier, &err("boom")).is_none());
    }

    #[test]
    fn test_closure_classifier() {
        let only_first = |_: &TestError, attempt: u32| attempt < 2;
        assert!(only_first.should_retry(&err("x"), 1));
        assert!(!only_first.should_retry(&err("x"), 2));
    }

    #[test]
    fn test_http_status_retryable() {
        assert!(HttpRetryClassifier::is_status_retryable(500));
        assert!(HttpRetryClassifier::is_status_retryable(503));
        assert!(HttpRetryClassifier::is_status_retryable(429));

        assert!(!HttpRetryClassifier::is_status_retryable(200));
        assert!(!HttpRetryClassifier::is_status_retryable(404));
    }

    #[test]
    fn test_http_classifier() {
        let classifier = HttpRetryClassifier;
        assert!(classifier.should_retry(&Status(None), 1));
        assert!(classifier.should_retry(&Status(Some(500)), 1));
        assert!(classifier.should_retry(&Status(Some(501)), 1));
        assert!(classifier.should_retry(&Status(Some(408)), 1));
        assert!(classifier.should_retry(&Status(Some(429)), 1));
        assert!(!classifier.should_retry(&Status(Some(400)), 1));
        assert!(!classifier.should_retry(&Status(Some(404)), 1));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(
            HttpRetryClassifier::parse_retry_after("60"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            HttpRetryClassifier::parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert!(HttpRetryClassifier::parse_retry_after("invalid").is_none());
    }
}
