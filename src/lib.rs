//! Replicator - event-driven replica synchronization.
//!
//! Each service owns one entity (clients, orders or products) and keeps
//! read-only replicas of the others. Owners publish change notifications to
//! a shared RabbitMQ topic exchange after committing; every other service
//! consumes them and applies them idempotently to its local replica tables.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod health;
pub mod publisher;
pub mod replica;
pub mod router;
pub mod storage;
pub mod subscriber;
pub mod topology;
pub mod utils;

pub use envelope::{Action, EntityKind, EventEnvelope, RoutingKey};
pub use publisher::{PublishOutcome, Publisher};
pub use router::{Dispatch, EventRouter};
pub use subscriber::{Subscriber, SubscriberConfig, SubscriberHandle, SubscriberState};
