//! Mock bus implementations for testing.
//!
//! `MockEventBus` records published envelopes and can be told to fail.
//! `MockConsumerTransport` feeds queued messages to subscriber sessions, can
//! refuse connections to simulate a broker outage, and can drop the live
//! session to force a reconnect.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use super::{Acker, BusError, ConsumerSession, ConsumerTransport, Delivery, EventBus, Result};
use crate::envelope::EventEnvelope;
use crate::topology::SubscriberTopology;

/// Mock event bus for testing.
#[derive(Default)]
pub struct MockEventBus {
    published: RwLock<Vec<EventEnvelope>>,
    fail_on_publish: RwLock<bool>,
    closed: AtomicBool,
}

impl MockEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<EventEnvelope> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventBus for MockEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Connection("Mock bus closed".to_string()));
        }
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published.write().await.push(envelope.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// How a mock delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Rejected,
}

type Settlements = Arc<RwLock<Vec<(String, AckOutcome)>>>;

struct MockAcker {
    routing_key: String,
    settlements: Settlements,
}

#[async_trait]
impl Acker for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.settlements
            .write()
            .await
            .push((self.routing_key.clone(), AckOutcome::Acked));
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.settlements
            .write()
            .await
            .push((self.routing_key.clone(), AckOutcome::Rejected));
        Ok(())
    }
}

/// In-memory consumer transport.
pub struct MockConsumerTransport {
    sender: mpsc::UnboundedSender<(String, Vec<u8>)>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<(String, Vec<u8>)>>>,
    available: AtomicBool,
    open_attempts: AtomicUsize,
    settlements: Settlements,
    topologies: RwLock<Vec<SubscriberTopology>>,
    generation: watch::Sender<u64>,
}

impl Default for MockConsumerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConsumerTransport {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            available: AtomicBool::new(true),
            open_attempts: AtomicUsize::new(0),
            settlements: Arc::new(RwLock::new(Vec::new())),
            topologies: RwLock::new(Vec::new()),
            generation,
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// End the live session as if the broker dropped the connection.
    pub fn drop_connection(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Queue a raw message for delivery.
    pub fn push_raw(&self, routing_key: impl Into<String>, body: impl Into<Vec<u8>>) {
        let _ = self.sender.send((routing_key.into(), body.into()));
    }

    /// Queue an envelope, routed by its event type.
    pub fn push(&self, envelope: &EventEnvelope) {
        let body = serde_json::to_vec(envelope).unwrap_or_default();
        self.push_raw(envelope.event.clone(), body);
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub async fn settlements(&self) -> Vec<(String, AckOutcome)> {
        self.settlements.read().await.clone()
    }

    /// Topologies declared by successful opens, in order.
    pub async fn declared(&self) -> Vec<SubscriberTopology> {
        self.topologies.read().await.clone()
    }
}

#[async_trait]
impl ConsumerTransport for MockConsumerTransport {
    async fn open(&self, topology: &SubscriberTopology) -> Result<Box<dyn ConsumerSession>> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Mock broker unavailable".to_string()));
        }
        self.topologies.write().await.push(topology.clone());

        Ok(Box::new(MockSession {
            receiver: Arc::clone(&self.receiver),
            settlements: Arc::clone(&self.settlements),
            generation: self.generation.subscribe(),
        }))
    }
}

struct MockSession {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<(String, Vec<u8>)>>>,
    settlements: Settlements,
    generation: watch::Receiver<u64>,
}

#[async_trait]
impl ConsumerSession for MockSession {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            _ = self.generation.changed() => None,
            message = receiver.recv() => message.map(|(routing_key, body)| {
                let acker = MockAcker {
                    routing_key: routing_key.clone(),
                    settlements: Arc::clone(&self.settlements),
                };
                Ok(Delivery::new(routing_key, body, Box::new(acker)))
            }),
        }
    }

    async fn close(self: Box<Self>) {}
}
