//! Health monitoring
//!
//! Named probes are invoked concurrently, each in its own task under a time
//! budget. A probe that errors, times out or panics reports UNHEALTHY. The
//! overall status is the worst component status, and every check replaces the
//! stored report wholesale.

use crate::clock::Clock;
use crate::events::{EngineEvent, EventBus};
use crate::timeout::with_timeout;
use async_trait::async_trait;
use bulwark_error::{BulwarkError, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Health status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but functional
    Degraded,
    /// Component is unhealthy
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What a probe reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Reported status
    pub status: HealthStatus,
    /// Human-readable detail
    pub detail: Option<String>,
}

impl ProbeResult {
    /// Create a healthy result
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: None,
        }
    }

    /// Create a degraded result
    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            detail: Some(detail.into()),
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }

    /// Attach detail to any result
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Status of one component in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Reported status
    pub status: HealthStatus,
    /// Human-readable detail
    pub detail: Option<String>,
    /// When the probe finished
    pub checked_at: DateTime<Utc>,
}

/// Result of one health check across all probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Worst component status; HEALTHY with no components
    pub overall: HealthStatus,
    /// Per-component status, keyed by probe name
    pub components: BTreeMap<String, ComponentStatus>,
    /// When the check started
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report, deriving the overall status
    pub fn new(components: BTreeMap<String, ComponentStatus>, checked_at: DateTime<Utc>) -> Self {
        let overall = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            overall,
            components,
            checked_at,
        }
    }

    /// Status of one component
    pub fn status_of(&self, name: &str) -> Option<HealthStatus> {
        self.components.get(name).map(|c| c.status)
    }

    /// Components that are not HEALTHY
    pub fn unhealthy_components(&self) -> impl Iterator<Item = (&str, &ComponentStatus)> {
        self.components
            .iter()
            .filter(|(_, c)| c.status != HealthStatus::Healthy)
            .map(|(name, c)| (name.as_str(), c))
    }

    /// Whether every component is HEALTHY
    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }
}

/// A named health check
#[async_trait]
pub trait Probe: Send + Sync {
    /// Inspect the component
    async fn check(&self) -> Result<ProbeResult>;
}

/// Probe backed by an async closure
pub struct FnProbe<F> {
    f: F,
}

/// Wrap an async closure as a [`Probe`]
pub fn probe_fn<F, Fut>(f: F) -> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResult>> + Send,
{
    FnProbe { f }
}

#[async_trait]
impl<F, Fut> Probe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResult>> + Send,
{
    async fn check(&self) -> Result<ProbeResult> {
        (self.f)().await
    }
}

/// Runs probes and keeps the latest report
pub struct HealthMonitor {
    probes: RwLock<BTreeMap<String, Arc<dyn Probe>>>,
    current: RwLock<Option<Arc<HealthReport>>>,
    probe_timeout: Duration,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor with no probes
    pub fn new(probe_timeout: Duration, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            probes: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
            probe_timeout,
            clock,
            events,
        }
    }

    /// Register (or replace) a probe
    pub async fn register_probe(&self, name: impl Into<String>, probe: impl Probe + 'static) {
        self.register_shared_probe(name, Arc::new(probe)).await;
    }

    /// Register (or replace) a shared probe
    pub async fn register_shared_probe(&self, name: impl Into<String>, probe: Arc<dyn Probe>) {
        let name = name.into();
        tracing::debug!(probe = %name, "Registered health probe");
        self.probes.write().await.insert(name, probe);
    }

    /// Remove a probe; returns whether it existed
    pub async fn unregister_probe(&self, name: &str) -> bool {
        self.probes.write().await.remove(name).is_some()
    }

    /// Registered probe names
    pub async fn probe_names(&self) -> Vec<String> {
        self.probes.read().await.keys().cloned().collect()
    }

    /// Invoke every probe and replace the stored report
    pub async fn check_system_health(&self) -> Arc<HealthReport> {
        let checked_at = self.clock.now();
        let probes: Vec<(String, Arc<dyn Probe>)> = self
            .probes
            .read()
            .await
            .iter()
            .map(|(name, probe)| (name.clone(), Arc::clone(probe)))
            .collect();

        let checks = probes
            .into_iter()
            .map(|(name, probe)| self.run_probe(name, probe));
        let components: BTreeMap<String, ComponentStatus> = join_all(checks).await.into_iter().collect();

        let report = Arc::new(HealthReport::new(components, checked_at));
        let previous = self.current.write().await.replace(Arc::clone(&report));

        let previous_overall = previous.map(|r| r.overall);
        if previous_overall != Some(report.overall) {
            match report.overall {
                HealthStatus::Healthy => tracing::info!(overall = %report.overall, "System health changed"),
                _ => tracing::warn!(
                    overall = %report.overall,
                    failing = ?report.unhealthy_components().map(|(n, _)| n).collect::<Vec<_>>(),
                    "System health changed"
                ),
            }
        }

        self.events
            .emit(EngineEvent::HealthUpdated(Arc::clone(&report)));
        report
    }

    /// Most recent report, if any check has run
    pub async fn current_report(&self) -> Option<Arc<HealthReport>> {
        self.current.read().await.clone()
    }

    /// Overall status of the most recent report
    pub async fn overall_status(&self) -> Option<HealthStatus> {
        self.current.read().await.as_ref().map(|r| r.overall)
    }

    async fn run_probe(&self, name: String, probe: Arc<dyn Probe>) -> (String, ComponentStatus) {
        let task = tokio::spawn(async move { probe.check().await });
        let abort = task.abort_handle();

        let failure = |cause: String| {
            BulwarkError::ProbeThrew {
                name: name.clone(),
                cause,
            }
            .to_string()
        };

        let result = match with_timeout(self.probe_timeout, name.as_str(), task).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => ProbeResult::unhealthy(failure(e.to_string())),
            Ok(Err(join_err)) => ProbeResult::unhealthy(failure(if join_err.is_panic() {
                "probe panicked".to_string()
            } else {
                join_err.to_string()
            })),
            Err(timeout) => {
                abort.abort();
                ProbeResult::unhealthy(failure(format!("timed out after {:?}", timeout.duration)))
            }
        };

        if result.status != HealthStatus::Healthy {
            tracing::debug!(
                probe = %name,
                status = %result.status,
                detail = result.detail.as_deref().unwrap_or(""),
                "Probe not healthy"
            );
        }

        let status = ComponentStatus {
            status: result.status,
            detail: result.detail,
            checked_at: self.clock.now(),
        };
        (name, status)
    }
}
