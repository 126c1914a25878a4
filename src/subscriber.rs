//! Long-running consumer that keeps local replicas in line.
//!
//! The loop never gives up on the transport: open failures and dropped
//! sessions both lead back to `Connecting` after a fixed delay. Only the stop
//! signal ends it. Messages are handled one at a time; a message already
//! being applied runs to completion before stop is honoured.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{ConsumerSession, ConsumerTransport, Delivery, Result};
use crate::config::{BrokerConfig, ServiceConfig};
use crate::envelope::EventEnvelope;
use crate::router::EventRouter;
use crate::topology::SubscriberTopology;

/// Lifecycle of the consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Consuming,
    Stopped,
}

/// Subscriber settings, built once at startup.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub topology: SubscriberTopology,
    pub reconnect_delay: Duration,
}

impl SubscriberConfig {
    pub fn new(topology: SubscriberTopology, reconnect_delay: Duration) -> Self {
        Self {
            topology,
            reconnect_delay,
        }
    }

    pub fn from_broker(broker: &BrokerConfig, service: &ServiceConfig) -> Self {
        let topology = SubscriberTopology::for_role(&broker.exchange, service.role, broker.prefetch)
            .with_bindings(service.bindings());
        Self::new(topology, broker.reconnect_delay())
    }
}

/// Why a consuming session ended.
enum SessionEnd {
    Stopped,
    Lost,
}

pub struct Subscriber {
    transport: Arc<dyn ConsumerTransport>,
    router: Arc<EventRouter>,
    config: SubscriberConfig,
}

impl Subscriber {
    pub fn new(
        transport: Arc<dyn ConsumerTransport>,
        router: Arc<EventRouter>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            transport,
            router,
            config,
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> SubscriberHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SubscriberState::Connecting);

        let task = tokio::spawn(async move {
            self.run(stop_rx, &state_tx).await;
            state_tx.send_replace(SubscriberState::Stopped);
            info!("Subscriber stopped");
        });

        SubscriberHandle {
            stop: stop_tx,
            state: state_rx,
            task,
        }
    }

    async fn run(&self, mut stop: watch::Receiver<bool>, state: &watch::Sender<SubscriberState>) {
        let topology = &self.config.topology;

        loop {
            state.send_replace(SubscriberState::Connecting);

            let opened = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => return,
                opened = self.transport.open(topology) => opened,
            };

            match opened {
                Ok(mut session) => {
                    state.send_replace(SubscriberState::Consuming);
                    info!(
                        exchange = %topology.exchange,
                        bindings = ?topology.bindings,
                        "Consumer connected, processing messages"
                    );

                    let end = self.consume(session.as_mut(), &mut stop).await;
                    session.close().await;

                    if let SessionEnd::Stopped = end {
                        return;
                    }
                    warn!(
                        delay = ?self.config.reconnect_delay,
                        "Consumer session lost, reconnecting"
                    );
                }
                Err(e) => {
                    error!(
                        error = %e,
                        delay = ?self.config.reconnect_delay,
                        "Failed to set up consumer, retrying"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn consume(
        &self,
        session: &mut dyn ConsumerSession,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(stop) => return SessionEnd::Stopped,
                next = session.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(error = %e, "Consumer delivery error");
                    return SessionEnd::Lost;
                }
                None => {
                    info!("Consumer stream ended");
                    return SessionEnd::Lost;
                }
            };

            if let Err(e) = self.process_delivery(delivery).await {
                error!(error = %e, "Failed to settle delivery, recycling connection");
                return SessionEnd::Lost;
            }
        }
    }

    /// Decode, dispatch, then ack. Anything unprocessable is rejected
    /// without requeue.
    async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let envelope = match EventEnvelope::from_slice(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Rejecting malformed message"
                );
                return delivery.reject().await;
            }
        };

        match self.router.dispatch(&envelope).await {
            Ok(dispatch) => {
                debug!(event = %envelope.event, outcome = ?dispatch, "Event handled");
                delivery.ack().await
            }
            Err(e) => {
                error!(event = %envelope.event, error = %e, "Failed to apply event, rejecting");
                delivery.reject().await
            }
        }
    }
}

/// Resolves once stop is signalled or the stop sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Control handle for a spawned subscriber.
pub struct SubscriberHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<SubscriberState>,
    task: JoinHandle<()>,
}

impl SubscriberHandle {
    /// Liveness: the task is running and has not stopped.
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished() && *self.state.borrow() != SubscriberState::Stopped
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// A receiver for watching state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<SubscriberState> {
        self.state.clone()
    }

    /// Signal stop and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Subscriber task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use tokio::sync::Notify;

    use super::*;
    use crate::bus::{AckOutcome, MockConsumerTransport};
    use crate::envelope::{Action, EntityKind};
    use crate::replica::{ApplyError, ApplyOutcome, ReplicaHandler};
    use crate::topology::{ServiceRole, DEFAULT_EXCHANGE};

    const WAIT: Duration = Duration::from_secs(5);

    /// Client handler that blocks mid-apply until released.
    #[derive(Default)]
    struct GatedHandler {
        started: Notify,
        release: Notify,
        applied: AtomicBool,
    }

    #[async_trait]
    impl ReplicaHandler for GatedHandler {
        fn entity(&self) -> EntityKind {
            EntityKind::Client
        }

        async fn apply(
            &self,
            _action: Action,
            _data: &Map<String, Value>,
        ) -> std::result::Result<ApplyOutcome, ApplyError> {
            self.started.notify_one();
            self.release.notified().await;
            self.applied.store(true, Ordering::SeqCst);
            Ok(ApplyOutcome::Deleted)
        }
    }

    fn config() -> SubscriberConfig {
        SubscriberConfig::new(
            SubscriberTopology::for_role(DEFAULT_EXCHANGE, ServiceRole::Orders, 1),
            Duration::from_millis(10),
        )
    }

    fn spawn(transport: &Arc<MockConsumerTransport>) -> SubscriberHandle {
        Subscriber::new(transport.clone(), Arc::new(EventRouter::new()), config()).spawn()
    }

    async fn wait_for_state(handle: &SubscriberHandle, wanted: SubscriberState) {
        let mut rx = handle.state_receiver();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    async fn wait_for_settlements(transport: &MockConsumerTransport, count: usize) {
        tokio::time::timeout(WAIT, async {
            while transport.settlements().await.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for settlements");
    }

    #[test]
    fn test_config_from_broker_uses_service_bindings() {
        let broker = BrokerConfig::default();
        let service = ServiceConfig {
            role: ServiceRole::Products,
            bindings: None,
        };

        let config = SubscriberConfig::from_broker(&broker, &service);
        assert_eq!(config.topology.bindings, vec!["order.*".to_string()]);
        assert_eq!(config.topology.prefetch, 1);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));

        let broker = BrokerConfig {
            prefetch: 0,
            ..BrokerConfig::default()
        };
        assert_eq!(SubscriberConfig::from_broker(&broker, &service).topology.prefetch, 1);
    }

    #[tokio::test]
    async fn test_acks_valid_and_rejects_malformed() {
        let transport = Arc::new(MockConsumerTransport::new());
        let handle = spawn(&transport);
        wait_for_state(&handle, SubscriberState::Consuming).await;

        transport.push_raw("client.created", b"not json".to_vec());
        transport.push(&EventEnvelope::deleted(EntityKind::Client, 1));
        wait_for_settlements(&transport, 2).await;

        assert_eq!(
            transport.settlements().await,
            vec![
                ("client.created".to_string(), AckOutcome::Rejected),
                ("client.deleted".to_string(), AckOutcome::Acked),
            ]
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_retries_until_transport_available() {
        let transport = Arc::new(MockConsumerTransport::new());
        transport.set_available(false);
        let handle = spawn(&transport);

        tokio::time::timeout(WAIT, async {
            while transport.open_attempts() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.state(), SubscriberState::Connecting);
        assert!(handle.is_alive());

        transport.set_available(true);
        wait_for_state(&handle, SubscriberState::Consuming).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_drop() {
        let transport = Arc::new(MockConsumerTransport::new());
        let handle = spawn(&transport);
        wait_for_state(&handle, SubscriberState::Consuming).await;

        transport.drop_connection();
        tokio::time::timeout(WAIT, async {
            while transport.declared().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        transport.push(&EventEnvelope::deleted(EntityKind::Product, 3));
        wait_for_settlements(&transport, 1).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_message_finish() {
        let handler = Arc::new(GatedHandler::default());
        let transport = Arc::new(MockConsumerTransport::new());
        let router = EventRouter::new().with_handler(handler.clone());
        let handle = Subscriber::new(transport.clone(), Arc::new(router), config()).spawn();
        wait_for_state(&handle, SubscriberState::Consuming).await;

        transport.push(&EventEnvelope::deleted(EntityKind::Client, 1));
        tokio::time::timeout(WAIT, handler.started.notified())
            .await
            .expect("handler never started");

        // What the handler and broker had seen by the time the loop reported Stopped.
        let mut state = handle.state_receiver();
        let observer = {
            let handler = handler.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                state
                    .wait_for(|s| *s == SubscriberState::Stopped)
                    .await
                    .unwrap();
                (handler.applied.load(Ordering::SeqCst), transport.settlements().await)
            })
        };

        let stopping = tokio::spawn(handle.stop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert!(!observer.is_finished());
        assert!(transport.settlements().await.is_empty());

        handler.release.notify_one();
        tokio::time::timeout(WAIT, stopping).await.unwrap().unwrap();

        let (applied, settlements) = tokio::time::timeout(WAIT, observer).await.unwrap().unwrap();
        assert!(applied);
        assert_eq!(
            settlements,
            vec![("client.deleted".to_string(), AckOutcome::Acked)]
        );
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let transport = Arc::new(MockConsumerTransport::new());
        transport.set_available(false);
        let handle = spawn(&transport);
        let mut state = handle.state_receiver();

        handle.stop().await;
        assert_eq!(*state.borrow_and_update(), SubscriberState::Stopped);
    }
}
