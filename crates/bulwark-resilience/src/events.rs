//! Engine events for presentation-layer consumers

use crate::health::HealthReport;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber
const DEFAULT_CAPACITY: usize = 256;

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A breaker moved to OPEN
    BreakerOpened {
        /// Resource key
        key: String,
    },
    /// A breaker moved back to CLOSED
    BreakerClosed {
        /// Resource key
        key: String,
    },
    /// A fresh health report replaced the previous one
    HealthUpdated(Arc<HealthReport>),
    /// A recovery action ran
    RecoveryAttempted {
        /// Component name
        component: String,
        /// Whether the action reported success
        succeeded: bool,
    },
    /// Expired cache entries were swept
    CacheEvicted {
        /// Number of entries removed
        count: usize,
    },
}

/// Broadcast channel shared by all engine components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; dropped silently when nobody is listening
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::CacheEvicted { count: 3 });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::BreakerOpened { key: "api".into() });

        match rx.recv().await.unwrap() {
            EngineEvent::BreakerOpened { key } => assert_eq!(key, "api"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
