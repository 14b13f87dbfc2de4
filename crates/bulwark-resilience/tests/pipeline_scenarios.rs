//! End-to-end request scenarios through a full engine

use bulwark_resilience::{
    CircuitState, EngineConfig, FallbackReason, ManualClock, RequestOptions, ResilienceEngine,
    Source,
};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Upstream(&'static str);

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

async fn engine(config: EngineConfig, clock: Arc<ManualClock>) -> ResilienceEngine {
    ResilienceEngine::builder()
        .with_config(config.with_jitter(false))
        .with_clock(clock)
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_fails_twice_then_succeeds() {
    let clock = Arc::new(ManualClock::starting_now());
    let engine = engine(EngineConfig::default().with_retry_attempts(3), clock).await;
    let calls = AtomicU32::new(0);

    let fetched = engine
        .request(
            "quotes",
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Upstream("connection reset"))
                    } else {
                        Ok(vec![1, 2, 3])
                    }
                }
            },
            RequestOptions::new(),
        )
        .await;

    assert_eq!(fetched.source, Source::Live);
    assert_eq!(fetched.value, vec![1, 2, 3]);
    assert_eq!(fetched.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // two failures, then one success decays the count by one
    let breaker = engine.breakers().state("quotes").unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_rejects_without_calling() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = EngineConfig::default()
        .with_retry_attempts(1)
        .with_breaker_threshold(3)
        .with_breaker_cooldown(Duration::from_secs(60));
    let engine = engine(config, clock).await;
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let fetched: bulwark_resilience::Fetched<Vec<String>> = engine
            .request(
                "feed",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<Vec<String>, _>(Upstream("503 Service Unavailable")) }
                },
                RequestOptions::new(),
            )
            .await;
        assert_eq!(fetched.source, Source::Degraded);
        assert_eq!(fetched.reason, Some(FallbackReason::Exhausted));
    }
    assert_eq!(engine.breakers().circuit_state("feed"), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let fetched: bulwark_resilience::Fetched<Vec<String>> = engine
        .request(
            "feed",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Upstream>(vec!["never".to_string()]) }
            },
            RequestOptions::new(),
        )
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(fetched.source, Source::Degraded);
    assert_eq!(fetched.reason, Some(FallbackReason::BreakerOpen));
    assert!(fetched.value.is_empty());
    assert_eq!(fetched.attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_value_served_while_open() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = EngineConfig::default()
        .with_retry_attempts(1)
        .with_breaker_threshold(3)
        .with_cache_ttl(Duration::from_secs(10));
    let engine = engine(config, clock.clone()).await;

    let fetched = engine
        .request(
            "rates",
            |_| async { Ok::<_, Upstream>(1.25_f64) },
            RequestOptions::new(),
        )
        .await;
    assert_eq!(fetched.source, Source::Live);

    clock.advance(Duration::from_secs(11));

    for _ in 0..3 {
        let fetched = engine
            .request(
                "rates",
                |_| async { Err::<f64, _>(Upstream("connection refused")) },
                RequestOptions::new(),
            )
            .await;
        assert_eq!(fetched.source, Source::Stale);
        assert_eq!(fetched.value, 1.25);
    }

    let fetched = engine
        .request(
            "rates",
            |_| async { Ok::<_, Upstream>(9.99_f64) },
            RequestOptions::new(),
        )
        .await;
    assert_eq!(fetched.source, Source::Stale);
    assert_eq!(fetched.reason, Some(FallbackReason::BreakerOpen));
    assert_eq!(fetched.value, 1.25);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_recovers_after_cooldown() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = EngineConfig::default()
        .with_retry_attempts(1)
        .with_breaker_threshold(1)
        .with_breaker_cooldown(Duration::from_secs(30));
    let engine = engine(config, clock.clone()).await;

    let failed = engine
        .request(
            "api",
            |_| async { Err::<u32, _>(Upstream("timed out")) },
            RequestOptions::new().without_cache(),
        )
        .await;
    assert!(failed.is_degraded());
    assert_eq!(engine.breakers().circuit_state("api"), CircuitState::Open);

    clock.advance(Duration::from_secs(31));

    for expected in [CircuitState::HalfOpen, CircuitState::Closed] {
        let fetched = engine
            .request(
                "api",
                |_| async { Ok::<_, Upstream>(7_u32) },
                RequestOptions::new().without_cache(),
            )
            .await;
        assert_eq!(fetched.source, Source::Live);
        assert_eq!(engine.breakers().circuit_state("api"), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_final() {
    let clock = Arc::new(ManualClock::starting_now());
    let engine = engine(EngineConfig::default().with_retry_attempts(5), clock).await;
    let calls = AtomicU32::new(0);

    let fetched = engine
        .request(
            "users",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>(Upstream("404 Not Found")) }
            },
            RequestOptions::new().with_fallback("anonymous".to_string()),
        )
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fetched.value, "anonymous");
    assert_eq!(fetched.last_error.as_deref(), Some("404 Not Found"));
    assert_eq!(
        engine
            .breakers()
            .state("users")
            .map(|b| b.failure_count)
            .unwrap_or(0),
        1
    );
}
