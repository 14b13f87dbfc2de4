//! Recovery orchestration
//!
//! Maps component names to recovery actions. Every non-HEALTHY component in a
//! report is dispatched to its action; actions run concurrently and a failing
//! or panicking action never prevents the others from running.

use crate::events::{EngineEvent, EventBus};
use crate::health::{ComponentStatus, HealthReport};
use async_trait::async_trait;
use bulwark_error::{BulwarkError, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Action that tries to bring a component back to health
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Attempt recovery of `component`, last seen with `status`
    async fn recover(&self, component: &str, status: &ComponentStatus) -> Result<()>;
}

/// Recovery action backed by an async closure
pub struct FnRecovery<F> {
    f: F,
}

/// Wrap an async closure as a [`RecoveryAction`]
pub fn recovery_fn<F, Fut>(f: F) -> FnRecovery<F>
where
    F: Fn(String, ComponentStatus) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnRecovery { f }
}

#[async_trait]
impl<F, Fut> RecoveryAction for FnRecovery<F>
where
    F: Fn(String, ComponentStatus) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn recover(&self, component: &str, status: &ComponentStatus) -> Result<()> {
        (self.f)(component.to_string(), status.clone()).await
    }
}

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    /// Components whose action succeeded
    pub recovered: Vec<String>,
    /// Components whose action failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Non-healthy components with no registered action
    pub unhandled: Vec<String>,
}

impl RecoverySummary {
    /// Whether any action ran
    pub fn attempted(&self) -> bool {
        !self.recovered.is_empty() || !self.failed.is_empty()
    }
}

/// Dispatches non-healthy components to recovery actions
#[derive(Default)]
pub struct RecoveryOrchestrator {
    actions: RwLock<BTreeMap<String, Arc<dyn RecoveryAction>>>,
    events: EventBus,
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator").finish_non_exhaustive()
    }
}

impl RecoveryOrchestrator {
    /// Create an orchestrator with no actions
    pub fn new(events: EventBus) -> Self {
        Self {
            actions: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Register (or replace) the action for `component`
    pub async fn register_action(
        &self,
        component: impl Into<String>,
        action: impl RecoveryAction + 'static,
    ) {
        let component = component.into();
        tracing::debug!(component = %component, "Registered recovery action");
        self.actions
            .write()
            .await
            .insert(component, Arc::new(action));
    }

    /// Remove the action for `component`; returns whether it existed
    pub async fn unregister_action(&self, component: &str) -> bool {
        self.actions.write().await.remove(component).is_some()
    }

    /// Components with a registered action
    pub async fn components(&self) -> Vec<String> {
        self.actions.read().await.keys().cloned().collect()
    }

    /// Run the action of every non-HEALTHY component in `report`
    pub async fn attempt_recovery(&self, report: &HealthReport) -> RecoverySummary {
        let mut summary = RecoverySummary::default();
        let mut tasks = Vec::new();
        {
            let actions = self.actions.read().await;
            for (component, status) in report.unhealthy_components() {
                match actions.get(component) {
                    Some(action) => {
                        let action = Arc::clone(action);
                        let name = component.to_string();
                        let status = status.clone();
                        tasks.push((
                            component.to_string(),
                            tokio::spawn(async move { action.recover(&name, &status).await }),
                        ));
                    }
                    None => summary.unhandled.push(component.to_string()),
                }
            }
        }

        let names: Vec<String> = tasks.iter().map(|(name, _)| name.clone()).collect();
        let results = join_all(tasks.into_iter().map(|(_, task)| task)).await;

        for (component, result) in names.into_iter().zip(results) {
            let outcome = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join_err) if join_err.is_panic() => Err("recovery action panicked".to_string()),
                Err(join_err) => Err(join_err.to_string()),
            };

            let succeeded = outcome.is_ok();
            match outcome {
                Ok(()) => {
                    tracing::info!(component = %component, "Recovery succeeded");
                    summary.recovered.push(component.clone());
                }
                Err(reason) => {
                    let err = BulwarkError::RecoveryFailed {
                        component: component.clone(),
                        reason: reason.clone(),
                    };
                    tracing::warn!(error = %err, "Recovery failed");
                    summary.failed.push((component.clone(), reason));
                }
            }
            self.events.emit(EngineEvent::RecoveryAttempted {
                component,
                succeeded,
            });
        }

        summary
    }
}
