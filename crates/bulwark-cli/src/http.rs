//! HTTP fetcher and probe used by the CLI commands

use async_trait::async_trait;
use bulwark_resilience::{HttpRetryClassifier, HttpStatusError, Probe, ProbeResult};
use reqwest::header::RETRY_AFTER;
use std::time::{Duration, Instant};

/// Failure of one HTTP call
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The server answered with a non-2xx status
    #[error("HTTP {status} from {url}")]
    Status {
        /// Requested URL
        url: String,
        /// Response status
        status: u16,
        /// Parsed `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// The request never produced a response
    #[error("request to {url} failed: {source}")]
    Transport {
        /// Requested URL
        url: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// The body was not valid JSON
    #[error("invalid JSON from {url}: {source}")]
    Body {
        /// Requested URL
        url: String,
        /// Decode error
        #[source]
        source: reqwest::Error,
    },
}

impl HttpStatusError for HttpError {
    fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            // a garbled body will not improve on retry
            Self::Body { .. } => Some(422),
            Self::Transport { .. } => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// JSON-over-HTTP GET client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bulwark/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// GET `url` and decode the body as JSON
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| HttpError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(HttpRetryClassifier::parse_retry_after);
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                retry_after,
            });
        }

        response.json().await.map_err(|source| HttpError::Body {
            url: url.to_string(),
            source,
        })
    }
}

/// Health probe that GETs a URL
#[derive(Debug, Clone)]
pub struct HttpProbe {
    fetcher: HttpFetcher,
    url: String,
    slow_after: Duration,
}

impl HttpProbe {
    /// Probe `url`; responses slower than `slow_after` are DEGRADED
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>, slow_after: Duration) -> Self {
        Self {
            fetcher,
            url: url.into(),
            slow_after,
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bulwark_error::Result<ProbeResult> {
        let started = Instant::now();
        let outcome = self.fetcher.get_json(&self.url).await;
        let elapsed = started.elapsed();

        Ok(match outcome {
            Ok(_) if elapsed > self.slow_after => {
                ProbeResult::degraded(format!("slow response: {}ms", elapsed.as_millis()))
            }
            Ok(_) => ProbeResult::healthy().with_detail(format!("{}ms", elapsed.as_millis())),
            Err(e) => ProbeResult::unhealthy(e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_resilience::{
        EngineConfig, HealthStatus, RequestOptions, ResilienceEngine, RetryClassifier, Source,
    };

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5)).unwrap()
    }

    async fn engine(attempts: u32) -> ResilienceEngine {
        ResilienceEngine::new(
            EngineConfig::default()
                .with_retry_attempts(attempts)
                .with_retry_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quote")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"symbol":"ACME","price":12.5}"#)
            .create_async()
            .await;

        let value = fetcher()
            .get_json(&format!("{}/quote", server.url()))
            .await
            .unwrap();
        assert_eq!(value["price"], 12.5);
    }

    #[tokio::test]
    async fn test_status_error_carries_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/busy")
            .with_status(429)
            .with_header("retry-after", "2")
            .create_async()
            .await;

        let err = fetcher()
            .get_json(&format!("{}/busy", server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(HttpRetryClassifier.should_retry(&err, 1));
    }

    #[tokio::test]
    async fn test_not_found_is_called_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let engine = engine(4).await;
        let fetcher = fetcher();
        let url = format!("{}/missing", server.url());
        let fetched = engine
            .request(
                &url,
                |_| fetcher.get_json(&url),
                RequestOptions::new().with_retry_if(HttpRetryClassifier),
            )
            .await;

        mock.assert_async().await;
        assert_eq!(fetched.source, Source::Degraded);
        assert_eq!(fetched.value, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let engine = engine(3).await;
        let fetcher = fetcher();
        let url = format!("{}/flaky", server.url());
        let fetched = engine
            .request(
                &url,
                |_| fetcher.get_json(&url),
                RequestOptions::new().with_retry_if(HttpRetryClassifier),
            )
            .await;

        mock.assert_async().await;
        assert_eq!(fetched.attempts, 3);
        assert!(fetched.is_degraded());
    }

    #[tokio::test]
    async fn test_probe_reports_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/up")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        server
            .mock("GET", "/down")
            .with_status(500)
            .create_async()
            .await;

        let up = HttpProbe::new(fetcher(), format!("{}/up", server.url()), Duration::from_secs(5));
        let down = HttpProbe::new(fetcher(), format!("{}/down", server.url()), Duration::from_secs(5));

        assert_eq!(up.check().await.unwrap().status, HealthStatus::Healthy);
        assert_eq!(down.check().await.unwrap().status, HealthStatus::Unhealthy);
    }
}
