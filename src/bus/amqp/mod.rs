//! AMQP (RabbitMQ) transport.
//!
//! Publishing goes through a deadpool-managed connection pool: one pool per
//! service instance, a fresh channel per publish. Consuming opens a dedicated
//! connection per session so that a dead session takes nothing else with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::{Acker, BusError, ConsumerSession, ConsumerTransport, Delivery, EventBus, Result};
use crate::config::BrokerConfig;
use crate::envelope::EventEnvelope;
use crate::topology::{
    bind_all, declare_exchange, declare_exclusive_queue, SubscriberTopology, CONTENT_TYPE,
    PERSISTENT,
};

/// Pooled publisher connections per service instance.
const POOL_SIZE: usize = 10;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// AMQP publish side.
///
/// Envelopes go to the shared topic exchange with their event type as
/// routing key, marked persistent.
pub struct AmqpEventBus {
    pool: Pool,
    exchange: String,
    closed: AtomicBool,
}

impl AmqpEventBus {
    /// Connect and declare the exchange, retrying on a fixed delay.
    ///
    /// Gives up after `publish_max_attempts` attempts.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let manager = Manager::new(config.connection_url(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let backoff = ConstantBuilder::default()
            .with_delay(config.publish_retry_delay())
            .with_max_times(config.publish_max_attempts.saturating_sub(1));

        let declare = || {
            let pool = &pool;
            async move {
                let channel = Self::channel_from(pool).await?;
                declare_exchange(&channel, &config.exchange).await?;
                let _ = channel.close(REPLY_SUCCESS, "OK").await;
                Ok::<_, BusError>(())
            }
        };

        declare
            .retry(backoff)
            .notify(|err: &BusError, delay: Duration| {
                warn!(
                    error = %err,
                    delay = ?delay,
                    max_attempts = config.publish_max_attempts,
                    "Failed to connect to AMQP, retrying"
                );
            })
            .await?;

        info!(exchange = %config.exchange, "Connected to AMQP");

        Ok(Self {
            pool,
            exchange: config.exchange.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn channel_from(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }
}

#[async_trait]
impl EventBus for AmqpEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event = %envelope.event))]
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Publisher closed".to_string()));
        }

        let payload = envelope.to_bytes()?;
        let channel = Self::channel_from(&self.pool).await?;

        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT);

        let result = channel
            .basic_publish(
                &self.exchange,
                &envelope.event,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)));

        let result = match result {
            Ok(confirm) => confirm
                .await
                .map(|_| ())
                .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e))),
            Err(e) => Err(e),
        };

        let _ = channel.close(REPLY_SUCCESS, "OK").await;

        if result.is_ok() {
            debug!(
                exchange = %self.exchange,
                routing_key = %envelope.event,
                "Published envelope"
            );
        }
        result
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close();
            info!("AMQP publisher closed");
        }
    }
}

/// AMQP consume side.
pub struct AmqpConsumerTransport {
    url: String,
}

impl AmqpConsumerTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.connection_url(),
        }
    }
}

#[async_trait]
impl ConsumerTransport for AmqpConsumerTransport {
    async fn open(&self, topology: &SubscriberTopology) -> Result<Box<dyn ConsumerSession>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        match Self::setup_consumer(&connection, topology).await {
            Ok((channel, consumer)) => Ok(Box::new(AmqpSession {
                connection,
                channel,
                consumer,
            })),
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "setup failed").await;
                Err(e)
            }
        }
    }
}

impl AmqpConsumerTransport {
    /// Set up consumer channel, queue, and bindings.
    async fn setup_consumer(
        connection: &Connection,
        topology: &SubscriberTopology,
    ) -> Result<(Channel, lapin::Consumer)> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        declare_exchange(&channel, &topology.exchange).await?;
        let queue = declare_exclusive_queue(&channel).await?;
        bind_all(&channel, queue.name().as_str(), &topology.exchange, &topology.bindings)
            .await?;

        channel
            .basic_qos(topology.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &topology.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok((channel, consumer))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl ConsumerSession for AmqpSession {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|d| {
                    let acker = AmqpAcker { acker: d.acker };
                    Delivery::new(d.routing_key.as_str(), d.data, Box::new(acker))
                })
                .map_err(|e| BusError::Connection(format!("Consumer delivery error: {}", e))),
        )
    }

    async fn close(self: Box<Self>) {
        let _ = self.channel.close(REPLY_SUCCESS, "OK").await;
        let _ = self.connection.close(REPLY_SUCCESS, "OK").await;
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(format!("Failed to ack message: {}", e)))
    }

    async fn reject(&self) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| BusError::Ack(format!("Failed to reject message: {}", e)))
    }
}
