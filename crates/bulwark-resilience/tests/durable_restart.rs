//! Stale reads across an engine restart backed by the file tier

use bulwark_resilience::{
    EngineConfig, FallbackReason, FileDurableTier, ManualClock, RequestOptions, ResilienceEngine,
    Source,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    price: f64,
}

async fn engine(dir: &std::path::Path, clock: Arc<ManualClock>) -> ResilienceEngine {
    let tier = FileDurableTier::open(dir).await.unwrap();
    ResilienceEngine::builder()
        .with_config(
            EngineConfig::default()
                .with_retry_attempts(1)
                .with_cache_ttl(Duration::from_secs(60)),
        )
        .with_durable(Arc::new(tier))
        .with_clock(clock)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_stale_quote_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let quote = Quote {
        symbol: "ACME".into(),
        price: 12.5,
    };

    {
        let first = engine(dir.path(), clock.clone()).await;
        let served = quote.clone();
        let fetched = first
            .request(
                "quote:ACME",
                move |_| {
                    let served = served.clone();
                    async move { Ok::<_, std::io::Error>(served) }
                },
                RequestOptions::new(),
            )
            .await;
        assert_eq!(fetched.source, Source::Live);
    }

    clock.advance(Duration::from_secs(3600));

    let second = engine(dir.path(), clock.clone()).await;
    second.start().await;
    assert_eq!(second.cache().len(), 1);

    let fetched = second
        .request(
            "quote:ACME",
            |_| async { Err::<Quote, _>(std::io::Error::other("connection refused")) },
            RequestOptions::new(),
        )
        .await;
    second.shutdown().await;

    assert_eq!(fetched.source, Source::Stale);
    assert_eq!(fetched.reason, Some(FallbackReason::Exhausted));
    assert_eq!(fetched.value, quote);
}

#[tokio::test]
async fn test_entries_past_max_age_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());

    {
        let first = engine(dir.path(), clock.clone()).await;
        first
            .cache()
            .set("old", serde_json::json!({"v": 1}), None)
            .await;
    }

    clock.advance(Duration::from_secs(48 * 3600));

    let second = engine(dir.path(), clock).await;
    second.start().await;
    assert!(second.cache().is_empty());
    assert!(second.cache().get_allow_stale("old").await.is_none());
    second.shutdown().await;
}
