use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::types::{ModelId, RunErrorKind, RunId, StockId};

/// Lifecycle notifications fanned out to in-process subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    ModelRegistered {
        model_id: ModelId,
        name: String,
        version: String,
    },
    ModelDeleted {
        model_id: ModelId,
    },
    TrainingStarted {
        model_id: ModelId,
        run_id: RunId,
    },
    TrainingCompleted {
        model_id: ModelId,
        run_id: RunId,
        train_loss: Option<f64>,
        validation_loss: Option<f64>,
    },
    TrainingFailed {
        model_id: ModelId,
        run_id: RunId,
        kind: RunErrorKind,
        message: String,
    },
    PredictionsGenerated {
        batch_id: Uuid,
        model_id: ModelId,
        stock_id: StockId,
        count: usize,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget; having no subscribers is not an error
    pub fn publish(&self, event: ServiceEvent) {
        debug!("Event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(ServiceEvent::ModelDeleted { model_id: 4 });
        assert_eq!(rx.recv().await.unwrap(), ServiceEvent::ModelDeleted { model_id: 4 });
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(1).publish(ServiceEvent::TrainingStarted { model_id: 1, run_id: 1 });
    }

    #[test]
    fn test_serialized_with_type_tag() {
        let json = serde_json::to_value(ServiceEvent::TrainingStarted { model_id: 1, run_id: 2 }).unwrap();
        assert_eq!(json["type"], "training_started");
        assert_eq!(json["run_id"], 2);
    }
}
