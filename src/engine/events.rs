//! Engine event stream.
//!
//! The store remains the source of truth; events are a live feed for
//! progress output and completion waiting. Slow subscribers may lag.

use cadence_common::{InterruptType, Status};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    NodeStatusChanged {
        plan_execution_id: String,
        node_execution_id: String,
        node_id: String,
        from: Status,
        to: Status,
    },
    AdviseApplied {
        plan_execution_id: String,
        node_execution_id: String,
        advise: String,
    },
    InterruptRegistered {
        plan_execution_id: String,
        interrupt_id: String,
        interrupt_type: InterruptType,
        node_execution_id: Option<String>,
        applied: bool,
    },
    PlanCompleted {
        plan_execution_id: String,
        status: Status,
    },
}

impl OrchestrationEvent {
    pub fn plan_execution_id(&self) -> &str {
        match self {
            Self::NodeStatusChanged {
                plan_execution_id, ..
            }
            | Self::AdviseApplied {
                plan_execution_id, ..
            }
            | Self::InterruptRegistered {
                plan_execution_id, ..
            }
            | Self::PlanCompleted {
                plan_execution_id, ..
            } => plan_execution_id,
        }
    }
}

/// In-process fan-out of [`OrchestrationEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: OrchestrationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(OrchestrationEvent::PlanCompleted {
            plan_execution_id: "lost".into(),
            status: Status::Succeeded,
        });

        let mut rx = bus.subscribe();
        bus.publish(OrchestrationEvent::PlanCompleted {
            plan_execution_id: "pe".into(),
            status: Status::Failed,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.plan_execution_id(), "pe");
        assert_eq!(
            serde_json::to_value(&event).unwrap()["type"],
            serde_json::json!("plan_completed")
        );
    }
}
