//! Best-effort change notification after a local commit.
//!
//! The local write is the source of truth and is already committed when
//! `publish` runs. Every failure here (bad routing key, serialization,
//! transport) is logged and swallowed; nothing propagates to the caller.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::envelope::{Action, EntityKind, EventEnvelope, ParsedKey, RoutingKey};

/// What happened to a notification. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Dropped,
}

/// Publishes change notifications for one service instance.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn EventBus>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// Connect to RabbitMQ with bounded retries.
    ///
    /// An error here is fatal to startup when the publisher is required at
    /// boot.
    #[cfg(feature = "amqp")]
    pub async fn connect(config: &crate::config::BrokerConfig) -> crate::bus::Result<Self> {
        let bus = crate::bus::AmqpEventBus::connect(config).await?;
        Ok(Self::new(Arc::new(bus)))
    }

    /// Publish `data` under `event_type`. Never fails.
    pub async fn publish<T: Serialize + ?Sized>(&self, event_type: &str, data: &T) -> PublishOutcome {
        match Self::envelope(event_type, data) {
            Some(envelope) => self.send(envelope).await,
            None => PublishOutcome::Dropped,
        }
    }

    /// Publish on a background task; the caller does not wait.
    ///
    /// `data` is serialized before the task is spawned.
    pub fn publish_detached<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        data: &T,
    ) -> JoinHandle<PublishOutcome> {
        let envelope = Self::envelope(event_type, data);
        let publisher = self.clone();
        tokio::spawn(async move {
            match envelope {
                Some(envelope) => publisher.send(envelope).await,
                None => PublishOutcome::Dropped,
            }
        })
    }

    pub async fn created<T: Serialize + ?Sized>(&self, entity: EntityKind, data: &T) -> PublishOutcome {
        let key = RoutingKey::new(entity, Action::Created);
        self.publish(&key.to_string(), data).await
    }

    pub async fn updated<T: Serialize + ?Sized>(&self, entity: EntityKind, data: &T) -> PublishOutcome {
        let key = RoutingKey::new(entity, Action::Updated);
        self.publish(&key.to_string(), data).await
    }

    /// Deletion notice keyed by the entity's canonical key field.
    pub async fn deleted(&self, entity: EntityKind, id: i64) -> PublishOutcome {
        self.send(EventEnvelope::deleted(entity, id)).await
    }

    /// Release the transport. Safe to call more than once.
    pub async fn close(&self) {
        self.bus.close().await;
    }

    fn envelope<T: Serialize + ?Sized>(event_type: &str, data: &T) -> Option<EventEnvelope> {
        let key = match RoutingKey::parse(event_type) {
            ParsedKey::Known(key) => key,
            _ => {
                error!(event = %event_type, "Refusing to publish unknown routing key");
                return None;
            }
        };

        match serde_json::to_value(data) {
            Ok(Value::Object(map)) => Some(EventEnvelope::new(key, map)),
            Ok(other) => {
                error!(event = %event_type, kind = %json_kind(&other), "Event data must be a JSON object");
                None
            }
            Err(e) => {
                error!(event = %event_type, error = %e, "Failed to serialize event data");
                None
            }
        }
    }

    async fn send(&self, envelope: EventEnvelope) -> PublishOutcome {
        match self.bus.publish(&envelope).await {
            Ok(()) => {
                info!(event = %envelope.event, "Event published");
                PublishOutcome::Published
            }
            Err(e) => {
                error!(event = %envelope.event, error = %e, "Failed to publish event");
                PublishOutcome::Dropped
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockEventBus;
    use serde_json::json;

    #[derive(Serialize)]
    struct Product {
        id: i64,
        name: String,
    }

    fn publisher() -> (Publisher, Arc<MockEventBus>) {
        let bus = Arc::new(MockEventBus::new());
        (Publisher::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn test_publish_wraps_data_in_envelope() {
        let (publisher, bus) = publisher();
        let product = Product {
            id: 3,
            name: "Lamp".to_string(),
        };

        let outcome = publisher.created(EntityKind::Product, &product).await;
        assert_eq!(outcome, PublishOutcome::Published);

        let published = bus.take_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event, "product.created");
        assert_eq!(Value::Object(published[0].data.clone()), json!({"id": 3, "name": "Lamp"}));
    }

    #[tokio::test]
    async fn test_transport_failure_is_swallowed() {
        let (publisher, bus) = publisher();
        bus.set_fail_on_publish(true).await;

        let outcome = publisher.publish("client.updated", &json!({"id": 1})).await;
        assert_eq!(outcome, PublishOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_invalid_payloads_are_dropped() {
        let (publisher, bus) = publisher();

        assert_eq!(
            publisher.publish("order_created", &json!({"id": 1})).await,
            PublishOutcome::Dropped
        );
        assert_eq!(
            publisher.publish("client.created", &json!([1, 2])).await,
            PublishOutcome::Dropped
        );
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_deleted_uses_canonical_key() {
        let (publisher, bus) = publisher();
        publisher.deleted(EntityKind::Client, 11).await;

        let published = bus.take_published().await;
        assert_eq!(Value::Object(published[0].data.clone()), json!({"id": 11}));
    }

    #[tokio::test]
    async fn test_publish_detached_runs_in_background() {
        let (publisher, bus) = publisher();
        let handle = publisher.publish_detached("product.updated", &json!({"id": 2, "stock": 0}));

        assert_eq!(handle.await.unwrap(), PublishOutcome::Published);
        assert_eq!(bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (publisher, bus) = publisher();
        publisher.close().await;
        publisher.close().await;
        assert!(bus.is_closed());
        assert_eq!(
            publisher.updated(EntityKind::Client, &json!({"id": 1})).await,
            PublishOutcome::Dropped
        );
    }
}
