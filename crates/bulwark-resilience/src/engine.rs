//! Engine assembly and lifecycle
//!
//! [`ResilienceEngine`] owns one instance of every component, wires them to a
//! shared clock and event bus, registers the built-in probes and recovery
//! actions, and runs the background health and cache sweep loops.

use crate::cache::{CacheConfig, CacheStore};
use crate::circuit_breaker::{BreakerConfig, BreakerRegistry, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigRepair, EngineConfig};
use crate::durable::DurableTier;
use crate::events::{EngineEvent, EventBus};
use crate::health::{HealthMonitor, HealthReport, Probe, ProbeResult};
use crate::latency::LatencyTracker;
use crate::pipeline::{Fetched, RequestOptions, RequestPipeline};
use crate::recovery::{recovery_fn, RecoveryOrchestrator, RecoverySummary};
use crate::retry::RetryController;
use async_trait::async_trait;
use bulwark_error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Name of the built-in cache probe and recovery action
pub const CACHE_COMPONENT: &str = "cache";
/// Name of the built-in latency probe
pub const LATENCY_COMPONENT: &str = "pipeline-latency";
/// Name of the built-in breaker probe and recovery action
pub const BREAKERS_COMPONENT: &str = "circuit-breakers";

/// Component name used by [`ResilienceEngine::watch_endpoint`]
pub fn endpoint_component(key: &str) -> String {
    format!("breaker:{key}")
}

/// Builder for [`ResilienceEngine`]
#[derive(Debug, Default)]
pub struct ResilienceEngineBuilder {
    config: EngineConfig,
    durable: Option<Arc<dyn DurableTier>>,
    clock: Option<Arc<dyn Clock>>,
    event_capacity: Option<usize>,
}

impl ResilienceEngineBuilder {
    /// Use `config`; it is validated by [`build`](Self::build)
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Mirror cache writes into `tier`
    pub fn with_durable(mut self, tier: Arc<dyn DurableTier>) -> Self {
        self.durable = Some(tier);
        self
    }

    /// Read time from `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Buffer `capacity` events per subscriber
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Validate the config and assemble the engine
    pub async fn build(self) -> Result<ResilienceEngine> {
        let (config, repairs) = self.config.validate()?;
        for repair in &repairs {
            tracing::warn!(field = %repair.field, reason = %repair.reason, "Config value repaired");
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.event_capacity.map(EventBus::new).unwrap_or_default();

        let mut cache = CacheStore::new(CacheConfig::from(&config), clock.clone(), events.clone());
        if let Some(tier) = self.durable {
            cache = cache.with_durable(tier);
        }
        let cache = Arc::new(cache);
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::from(&config),
            clock.clone(),
            events.clone(),
        ));
        let latency = Arc::new(LatencyTracker::new());
        let retry = RetryController::from_config(&config, clock.clone());
        let pipeline = RequestPipeline::new(
            Arc::clone(&cache),
            Arc::clone(&breakers),
            retry,
            Arc::clone(&latency),
        );
        let health = Arc::new(HealthMonitor::new(
            config.probe_timeout(),
            clock.clone(),
            events.clone(),
        ));
        let recovery = Arc::new(RecoveryOrchestrator::new(events.clone()));

        let engine = ResilienceEngine {
            config,
            repairs,
            events,
            cache,
            breakers,
            latency,
            pipeline,
            health,
            recovery,
            lifecycle: Mutex::new(None),
        };
        engine.register_builtins().await;
        Ok(engine)
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Resilience engine: cached, isolated, retried requests plus health-driven recovery
pub struct ResilienceEngine {
    config: EngineConfig,
    repairs: Vec<ConfigRepair>,
    events: EventBus,
    cache: Arc<CacheStore<serde_json::Value>>,
    breakers: Arc<BreakerRegistry>,
    latency: Arc<LatencyTracker>,
    pipeline: RequestPipeline,
    health: Arc<HealthMonitor>,
    recovery: Arc<RecoveryOrchestrator>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl std::fmt::Debug for ResilienceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl ResilienceEngine {
    /// Start building an engine
    pub fn builder() -> ResilienceEngineBuilder {
        ResilienceEngineBuilder::default()
    }

    /// Engine with `config`, the system clock and no durable tier
    pub async fn new(config: EngineConfig) -> Result<Self> {
        Self::builder().with_config(config).build().await
    }

    async fn register_builtins(&self) {
        self.health
            .register_probe(
                CACHE_COMPONENT,
                CacheProbe {
                    cache: Arc::clone(&self.cache),
                },
            )
            .await;
        self.health
            .register_probe(
                LATENCY_COMPONENT,
                LatencyProbe {
                    latency: Arc::clone(&self.latency),
                    threshold: self.config.latency_degraded(),
                },
            )
            .await;
        self.health
            .register_probe(
                BREAKERS_COMPONENT,
                BreakersProbe {
                    breakers: Arc::clone(&self.breakers),
                },
            )
            .await;

        let cache = Arc::clone(&self.cache);
        self.recovery
            .register_action(
                CACHE_COMPONENT,
                recovery_fn(move |_, _| {
                    let cache = Arc::clone(&cache);
                    async move {
                        let evicted = cache.cleanup().await;
                        tracing::debug!(evicted, "Cache recovery swept expired entries");
                        Ok(())
                    }
                }),
            )
            .await;

        let breakers = Arc::clone(&self.breakers);
        self.recovery
            .register_action(
                BREAKERS_COMPONENT,
                recovery_fn(move |_, _| {
                    let breakers = Arc::clone(&breakers);
                    async move {
                        let reset = breakers.reset_expired();
                        tracing::debug!(reset, "Reset breakers past their cooldown");
                        Ok(())
                    }
                }),
            )
            .await;
    }

    /// Validated configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Repairs applied while validating the configuration
    pub fn config_repairs(&self) -> &[ConfigRepair] {
        &self.repairs
    }

    /// Shared cache
    pub fn cache(&self) -> &Arc<CacheStore<serde_json::Value>> {
        &self.cache
    }

    /// Breaker registry
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Latency averages
    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }

    /// Retry controller
    pub fn retry(&self) -> &RetryController {
        self.pipeline.retry()
    }

    /// Request pipeline
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Health monitor
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Recovery orchestrator
    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Run `operation` through cache, breaker and retry for `resource_key`
    pub async fn request<T, E, F, Fut>(
        &self,
        resource_key: &str,
        operation: F,
        options: RequestOptions<T, E>,
    ) -> Fetched<T>
    where
        T: Serialize + DeserializeOwned + Default,
        E: std::fmt::Display + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.pipeline.request(resource_key, operation, options).await
    }

    /// Register a probe and recovery action tracking the breaker of `key`
    pub async fn watch_endpoint(&self, key: &str) {
        let component = endpoint_component(key);
        self.health
            .register_probe(
                component.clone(),
                BreakerProbe {
                    breakers: Arc::clone(&self.breakers),
                    key: key.to_string(),
                },
            )
            .await;

        let breakers = Arc::clone(&self.breakers);
        let key = key.to_string();
        self.recovery
            .register_action(
                component,
                recovery_fn(move |_, _| {
                    let breakers = Arc::clone(&breakers);
                    let key = key.clone();
                    async move {
                        breakers.reset(&key);
                        Ok(())
                    }
                }),
            )
            .await;
    }

    /// Run every probe once
    pub async fn check_health(&self) -> Arc<HealthReport> {
        self.health.check_system_health().await
    }

    /// Run recovery actions for the non-healthy components of `report`
    pub async fn attempt_recovery(&self, report: &HealthReport) -> RecoverySummary {
        self.recovery.attempt_recovery(report).await
    }

    /// Whether the background loops are running
    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Restore the cache and spawn the health and cache sweep loops
    ///
    /// Calling `start` on a running engine does nothing.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            tracing::debug!("Engine already running");
            return;
        }

        let restored = self.cache.restore().await;
        tracing::info!(restored, "Engine starting");

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(health_loop(
                Arc::clone(&self.health),
                Arc::clone(&self.recovery),
                self.config.health_interval(),
                self.config.auto_recovery_enabled,
                cancel.child_token(),
            )),
            tokio::spawn(sweep_loop(
                Arc::clone(&self.cache),
                self.config.cleanup_interval(),
                cancel.child_token(),
            )),
        ];
        *lifecycle = Some(Lifecycle { cancel, tasks });
    }

    /// Stop the background loops and wait for them to finish
    pub async fn shutdown(&self) {
        let Some(Lifecycle { cancel, tasks }) = self.lifecycle.lock().await.take() else {
            return;
        };
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Engine stopped");
    }
}

impl Drop for ResilienceEngine {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.lifecycle.get_mut().take() {
            lifecycle.cancel.cancel();
        }
    }
}

async fn health_loop(
    health: Arc<HealthMonitor>,
    recovery: Arc<RecoveryOrchestrator>,
    period: Duration,
    auto_recovery: bool,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = health.check_system_health().await;
                if auto_recovery && !report.is_healthy() {
                    let summary = recovery.attempt_recovery(&report).await;
                    if summary.attempted() {
                        tracing::info!(
                            recovered = summary.recovered.len(),
                            failed = summary.failed.len(),
                            "Auto-recovery pass finished"
                        );
                    }
                }
            }
        }
    }
    tracing::debug!("Health loop stopped");
}

async fn sweep_loop(
    cache: Arc<CacheStore<serde_json::Value>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                cache.cleanup().await;
            }
        }
    }
    tracing::debug!("Cache sweep loop stopped");
}

struct CacheProbe {
    cache: Arc<CacheStore<serde_json::Value>>,
}

#[async_trait]
impl Probe for CacheProbe {
    async fn check(&self) -> Result<ProbeResult> {
        let stats = self.cache.stats();
        if !self.cache.has_durable() {
            return Ok(ProbeResult::healthy().with_detail("volatile only"));
        }
        if stats.durable_available {
            Ok(ProbeResult::healthy().with_detail(format!("{} entries", stats.entries)))
        } else {
            Ok(ProbeResult::degraded(format!(
                "durable tier unavailable ({} failures)",
                stats.durable_failures
            )))
        }
    }
}

struct LatencyProbe {
    latency: Arc<LatencyTracker>,
    threshold: Duration,
}

#[async_trait]
impl Probe for LatencyProbe {
    async fn check(&self) -> Result<ProbeResult> {
        let slow = self.latency.slow_keys(self.threshold);
        if slow.is_empty() {
            return Ok(ProbeResult::healthy());
        }
        let listed: Vec<String> = slow
            .iter()
            .map(|(key, avg)| format!("{key} {}ms", avg.as_millis()))
            .collect();
        Ok(ProbeResult::degraded(format!("slow: {}", listed.join(", "))))
    }
}

struct BreakersProbe {
    breakers: Arc<BreakerRegistry>,
}

#[async_trait]
impl Probe for BreakersProbe {
    async fn check(&self) -> Result<ProbeResult> {
        let snapshot = self.breakers.snapshot();
        let open = snapshot
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .count();
        let half_open = snapshot
            .iter()
            .filter(|b| b.state == CircuitState::HalfOpen)
            .count();

        if open + half_open == 0 {
            return Ok(ProbeResult::healthy());
        }
        let detail = format!("{open} open, {half_open} half-open of {}", snapshot.len());
        if open == snapshot.len() {
            Ok(ProbeResult::unhealthy(detail))
        } else {
            Ok(ProbeResult::degraded(detail))
        }
    }
}

struct BreakerProbe {
    breakers: Arc<BreakerRegistry>,
    key: String,
}

#[async_trait]
impl Probe for BreakerProbe {
    async fn check(&self) -> Result<ProbeResult> {
        Ok(match self.breakers.circuit_state(&self.key) {
            CircuitState::Closed => ProbeResult::healthy(),
            CircuitState::HalfOpen => ProbeResult::degraded("half-open"),
            CircuitState::Open => ProbeResult::unhealthy("open"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::Outcome;
    use crate::clock::ManualClock;
    use crate::durable::MemoryDurableTier;
    use crate::health::HealthStatus;

    async fn engine_with(config: EngineConfig) -> ResilienceEngine {
        ResilienceEngine::builder()
            .with_config(config)
            .with_clock(Arc::new(ManualClock::starting_now()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_builtin_probes_registered() {
        let engine = engine_with(EngineConfig::default()).await;
        let names = engine.health().probe_names().await;
        assert!(names.contains(&CACHE_COMPONENT.to_string()));
        assert!(names.contains(&LATENCY_COMPONENT.to_string()));
        assert!(names.contains(&BREAKERS_COMPONENT.to_string()));

        let report = engine.check_health().await;
        assert_eq!(report.overall, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_build_repairs_config() {
        let config = EngineConfig {
            circuit_breaker_threshold: 0,
            ..EngineConfig::default()
        };
        let engine = engine_with(config).await;
        assert!(!engine.config_repairs().is_empty());
        assert!(engine.config().circuit_breaker_threshold >= 1);
    }

    #[tokio::test]
    async fn test_breaker_probe_levels() {
        let engine = engine_with(EngineConfig::default().with_breaker_threshold(1)).await;
        let breakers = engine.breakers();

        breakers.report_outcome("a", Outcome::Success);
        breakers.report_outcome("b", Outcome::Failure);
        let report = engine.check_health().await;
        assert_eq!(report.status_of(BREAKERS_COMPONENT), Some(HealthStatus::Degraded));

        breakers.report_outcome("a", Outcome::Failure);
        let report = engine.check_health().await;
        assert_eq!(report.status_of(BREAKERS_COMPONENT), Some(HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn test_degraded_durable_tier() {
        let tier = Arc::new(MemoryDurableTier::new());
        let engine = ResilienceEngine::builder()
            .with_durable(tier.clone())
            .build()
            .await
            .unwrap();

        tier.set_available(false);
        engine
            .cache()
            .set("k", serde_json::json!(1), None)
            .await;

        let report = engine.check_health().await;
        assert_eq!(report.status_of(CACHE_COMPONENT), Some(HealthStatus::Degraded));
    }

    #[tokio::test]
    async fn test_watch_endpoint_recovery_resets_breaker() {
        let engine = engine_with(EngineConfig::default().with_breaker_threshold(1)).await;
        engine.watch_endpoint("api").await;
        engine.breakers().report_outcome("api", Outcome::Failure);

        let report = engine.check_health().await;
        let component = endpoint_component("api");
        assert_eq!(report.status_of(&component), Some(HealthStatus::Unhealthy));

        let summary = engine.attempt_recovery(&report).await;
        assert!(summary.recovered.contains(&component));
        assert_eq!(engine.breakers().circuit_state("api"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_then_shutdown() {
        let engine = engine_with(EngineConfig::default()).await;
        let mut events = engine.subscribe();

        engine.start().await;
        engine.start().await;
        assert!(engine.is_running().await);

        // first health tick fires immediately
        match events.recv().await.unwrap() {
            EngineEvent::HealthUpdated(report) => assert!(report.is_healthy()),
            other => panic!("unexpected event {other:?}"),
        }

        engine.shutdown().await;
        assert!(!engine.is_running().await);
        engine.shutdown().await;
    }
}
