//! Broker topology shared by every service.
//!
//! One durable topic exchange carries all change notifications. Each
//! subscriber declares its own exclusive, auto-deleting queue and binds it to
//! the `<entity>.*` patterns for the entities it replicates. There is no
//! dead-letter exchange: rejected messages are dropped.

use serde::Deserialize;

use crate::envelope::EntityKind;

/// Exchange shared by all publishers and subscribers.
pub const DEFAULT_EXCHANGE: &str = "microservices";

/// Content type set on every published envelope.
pub const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// The three independently deployed services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    Customers,
    #[default]
    Orders,
    Products,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Customers => "customers",
            ServiceRole::Orders => "orders",
            ServiceRole::Products => "products",
        }
    }

    /// Entity this service is the source of truth for.
    pub fn owned_entity(&self) -> EntityKind {
        match self {
            ServiceRole::Customers => EntityKind::Client,
            ServiceRole::Orders => EntityKind::Order,
            ServiceRole::Products => EntityKind::Product,
        }
    }

    /// Foreign entities this service keeps local replicas of.
    pub fn replicated_entities(&self) -> Vec<EntityKind> {
        match self {
            ServiceRole::Orders => vec![EntityKind::Client, EntityKind::Product],
            ServiceRole::Customers | ServiceRole::Products => vec![EntityKind::Order],
        }
    }

    /// Binding patterns for this service's subscriber queue.
    pub fn bindings(&self) -> Vec<String> {
        self.replicated_entities()
            .iter()
            .map(EntityKind::binding_pattern)
            .collect()
    }
}

/// What a subscriber declares on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberTopology {
    pub exchange: String,
    pub bindings: Vec<String>,
    pub prefetch: u16,
    pub consumer_tag: String,
}

impl SubscriberTopology {
    /// `prefetch` is at least 1; AMQP treats 0 as unlimited.
    pub fn for_role(exchange: impl Into<String>, role: ServiceRole, prefetch: u16) -> Self {
        Self {
            exchange: exchange.into(),
            bindings: role.bindings(),
            prefetch: prefetch.max(1),
            consumer_tag: format!("{}-replicator", role.as_str()),
        }
    }

    /// Replace the role's default bindings.
    pub fn with_bindings(mut self, bindings: Vec<String>) -> Self {
        self.bindings = bindings;
        self
    }
}

#[cfg(feature = "amqp")]
pub use declare::{bind_all, declare_exchange, declare_exclusive_queue};

#[cfg(feature = "amqp")]
mod declare {
    use lapin::{
        options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
        types::FieldTable,
        Channel, ExchangeKind, Queue,
    };
    use tracing::info;

    use crate::bus::{BusError, Result};

    /// Declare the shared durable topic exchange. Idempotent.
    pub async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))
    }

    /// Declare a server-named, exclusive, auto-deleting queue.
    pub async fn declare_exclusive_queue(channel: &Channel) -> Result<Queue> {
        channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))
    }

    /// Bind `queue` to every routing pattern.
    pub async fn bind_all(
        channel: &Channel,
        queue: &str,
        exchange: &str,
        bindings: &[String],
    ) -> Result<()> {
        for routing_key in bindings {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;
        }

        info!(
            queue = %queue,
            exchange = %exchange,
            bindings = ?bindings,
            "Bound queue to exchange"
        );

        Ok(())
    }
}
