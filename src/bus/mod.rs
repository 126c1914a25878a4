//! Event bus for change notifications.
//!
//! This module contains:
//! - `EventBus` trait: publish side, one envelope at a time
//! - `ConsumerTransport` trait: consume side, one session per connection
//! - `Delivery`: a received message plus its ack/reject handle
//! - Implementations: AMQP (RabbitMQ), Mock

use async_trait::async_trait;

use crate::envelope::EventEnvelope;
use crate::topology::SubscriberTopology;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConsumerTransport, AmqpEventBus};
pub use mock::{AckOutcome, MockConsumerTransport, MockEventBus};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Publish side of the broker.
///
/// Implementations:
/// - `AmqpEventBus`: RabbitMQ via AMQP
/// - `MockEventBus`: In-memory mock for testing
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one envelope, routed by its event type.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()>;

    /// Release broker resources. Safe to call more than once.
    async fn close(&self);
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject without requeue: the broker drops the message.
    async fn reject(&self) -> Result<()>;
}

/// A message received from the broker.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A live consuming connection.
#[async_trait]
pub trait ConsumerSession: Send {
    /// Next delivery. `None` means the stream ended and the session is dead.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    /// Close channel and connection.
    async fn close(self: Box<Self>);
}

/// Opens consuming sessions against a declared topology.
///
/// Implementations:
/// - `AmqpConsumerTransport`: RabbitMQ via AMQP
/// - `MockConsumerTransport`: In-memory mock for testing
#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    /// Connect, declare exchange, queue and bindings, and start consuming.
    async fn open(&self, topology: &SubscriberTopology) -> Result<Box<dyn ConsumerSession>>;
}
