//! Routes decoded envelopes to the replica handler for their entity.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::envelope::{EntityKind, EventEnvelope, ParsedKey, RoutingKey};
use crate::replica::{ApplyError, ApplyOutcome, ReplicaHandler};

/// How a dispatched envelope was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Applied {
        key: RoutingKey,
        outcome: ApplyOutcome,
    },
    /// Entity prefix is not one of `client.`, `product.`, `order.`.
    UnknownEntity(String),
    /// Known entity, unrecognised action suffix.
    UnknownAction { entity: EntityKind, action: String },
    /// Known routing key, but this service keeps no replica of the entity.
    Unhandled(RoutingKey),
}

/// Dispatches envelopes by entity prefix, then action suffix.
#[derive(Default, Clone)]
pub struct EventRouter {
    handlers: HashMap<EntityKind, Arc<dyn ReplicaHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its entity, replacing any previous one.
    pub fn with_handler(mut self, handler: Arc<dyn ReplicaHandler>) -> Self {
        self.handlers.insert(handler.entity(), handler);
        self
    }

    pub fn handles(&self, entity: EntityKind) -> bool {
        self.handlers.contains_key(&entity)
    }

    /// Only handler failures are errors; unroutable envelopes are logged
    /// and reported as dropped.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<Dispatch, ApplyError> {
        let key = match envelope.routing_key() {
            ParsedKey::Known(key) => key,
            ParsedKey::UnknownEntity(prefix) => {
                warn!(event = %envelope.event, "Unknown entity, dropping event");
                return Ok(Dispatch::UnknownEntity(prefix));
            }
            ParsedKey::UnknownAction { entity, action } => {
                warn!(event = %envelope.event, "Unknown action, dropping event");
                return Ok(Dispatch::UnknownAction { entity, action });
            }
        };

        let Some(handler) = self.handlers.get(&key.entity) else {
            warn!(event = %envelope.event, "No replica for entity, dropping event");
            return Ok(Dispatch::Unhandled(key));
        };

        let outcome = handler.apply(key.action, &envelope.data).await?;
        Ok(Dispatch::Applied { key, outcome })
    }
}
