//! Ledger event bus
//!
//! Downstream collaborators (grade passback, search indexing) subscribe
//! here instead of polling the store. Emitting never fails a write: with no
//! subscribers the event is dropped.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::change_id::ChangeId;
use crate::models::ElementType;

/// Events emitted by the ledger services
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    DeploymentPublished {
        deployment_id: Uuid,
        change_id: ChangeId,
        activity_id: Uuid,
        elements: usize,
    },
    AttemptStarted {
        attempt_id: Uuid,
        student_id: Uuid,
        element_id: Uuid,
        ordinal: u32,
    },
    ProgressRecorded {
        deployment_id: Uuid,
        student_id: Uuid,
        element_id: Uuid,
        element_type: ElementType,
        attempt_id: Uuid,
        completion_value: Option<f64>,
    },
    WalkableCompleted {
        deployment_id: Uuid,
        student_id: Uuid,
        element_id: Uuid,
        element_attempt_id: Uuid,
    },
    ScopeEntryWritten {
        scope_id: Uuid,
        source_id: Uuid,
        version: ChangeId,
    },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LedgerEvent);
}

/// Broadcast bus for ledger events
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every event at debug level
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::DeploymentPublished {
                deployment_id,
                change_id,
                elements,
                ..
            } => {
                debug!(deployment_id = %deployment_id, change_id = %change_id, elements, "Deployment published");
            }
            LedgerEvent::AttemptStarted {
                attempt_id,
                element_id,
                ordinal,
                ..
            } => {
                debug!(attempt_id = %attempt_id, element_id = %element_id, ordinal, "Attempt started");
            }
            LedgerEvent::ProgressRecorded {
                element_id,
                attempt_id,
                completion_value,
                ..
            } => {
                debug!(
                    element_id = %element_id,
                    attempt_id = %attempt_id,
                    completion = ?completion_value,
                    "Progress recorded"
                );
            }
            LedgerEvent::WalkableCompleted {
                element_id,
                element_attempt_id,
                ..
            } => {
                debug!(element_id = %element_id, attempt_id = %element_attempt_id, "Walkable completed");
            }
            LedgerEvent::ScopeEntryWritten {
                scope_id,
                source_id,
                version,
            } => {
                debug!(scope_id = %scope_id, source_id = %source_id, version = %version, "Scope entry written");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        let scope_id = Uuid::new_v4();

        bus.emit(LedgerEvent::ScopeEntryWritten {
            scope_id,
            source_id: Uuid::nil(),
            version: ChangeId::from_unix(1_700_000_000, 0, 0),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            LedgerEvent::ScopeEntryWritten { scope_id: got, .. } => assert_eq!(got, scope_id),
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::with_capacity(0);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(LedgerEvent::WalkableCompleted {
            deployment_id: Uuid::nil(),
            student_id: Uuid::nil(),
            element_id: Uuid::nil(),
            element_attempt_id: Uuid::nil(),
        });
    }
}
