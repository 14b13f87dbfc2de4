//! Health aggregation and auto-recovery

use bulwark_resilience::{
    endpoint_component, probe_fn, BulwarkError, EngineConfig, EngineEvent, EventBus,
    HealthMonitor, HealthStatus, ManualClock, Outcome, ProbeResult, ResilienceEngine,
    SystemClock,
};
use std::sync::Arc;
use std::time::Duration;

fn monitor() -> HealthMonitor {
    HealthMonitor::new(
        Duration::from_secs(1),
        Arc::new(SystemClock),
        EventBus::default(),
    )
}

#[tokio::test]
async fn test_overall_is_worst_component() {
    let monitor = monitor();
    for name in ["db", "queue", "search"] {
        monitor
            .register_probe(name, probe_fn(|| async { Ok(ProbeResult::healthy()) }))
            .await;
    }
    monitor
        .register_probe(
            "cdn",
            probe_fn(|| async { Ok(ProbeResult::degraded("p99 above target")) }),
        )
        .await;

    let report = monitor.check_system_health().await;
    assert_eq!(report.overall, HealthStatus::Degraded);
    assert_eq!(report.components.len(), 4);

    monitor
        .register_probe(
            "billing",
            probe_fn(|| async { Err(BulwarkError::Other("connection refused".into())) }),
        )
        .await;

    let report = monitor.check_system_health().await;
    assert_eq!(report.overall, HealthStatus::Unhealthy);
    assert_eq!(report.status_of("billing"), Some(HealthStatus::Unhealthy));
    assert_eq!(report.status_of("cdn"), Some(HealthStatus::Degraded));
}

#[tokio::test(start_paused = true)]
async fn test_hung_probe_times_out() {
    let monitor = monitor();
    monitor
        .register_probe(
            "slow",
            probe_fn(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ProbeResult::healthy())
            }),
        )
        .await;
    monitor
        .register_probe("fast", probe_fn(|| async { Ok(ProbeResult::healthy()) }))
        .await;

    let report = monitor.check_system_health().await;
    assert_eq!(report.status_of("slow"), Some(HealthStatus::Unhealthy));
    assert_eq!(report.status_of("fast"), Some(HealthStatus::Healthy));
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_recovers_endpoint() {
    let engine = ResilienceEngine::builder()
        .with_config(
            EngineConfig::default()
                .with_breaker_threshold(1)
                .with_health_interval(Duration::from_secs(5))
                .with_auto_recovery(true),
        )
        .with_clock(Arc::new(ManualClock::starting_now()))
        .build()
        .await
        .unwrap();
    let mut events = engine.subscribe();

    engine.watch_endpoint("payments").await;
    engine.breakers().report_outcome("payments", Outcome::Failure);
    engine.start().await;

    let component = endpoint_component("payments");
    let mut recovered = false;
    for _ in 0..16 {
        if let EngineEvent::RecoveryAttempted {
            component: c,
            succeeded,
        } = events.recv().await.unwrap()
        {
            if c == component {
                recovered = succeeded;
                break;
            }
        }
    }
    assert!(recovered);

    engine.shutdown().await;
    assert_eq!(
        engine.breakers().circuit_state("payments"),
        bulwark_resilience::CircuitState::Closed
    );
}

#[tokio::test]
async fn test_recovery_disabled_leaves_breaker_open() {
    let engine = ResilienceEngine::builder()
        .with_config(
            EngineConfig::default()
                .with_breaker_threshold(1)
                .with_auto_recovery(false),
        )
        .build()
        .await
        .unwrap();
    engine.watch_endpoint("payments").await;
    engine.breakers().report_outcome("payments", Outcome::Failure);

    let report = engine.check_health().await;
    assert_eq!(report.overall, HealthStatus::Unhealthy);
    assert_eq!(
        engine.breakers().circuit_state("payments"),
        bulwark_resilience::CircuitState::Open
    );
}
