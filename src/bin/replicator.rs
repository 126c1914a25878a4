//! replicator: keeps a service's local replicas in line with its peers.
//!
//! ## Architecture
//! ```text
//! [owning service] --publish--> [microservices exchange] --client.* / product.* / order.*-->
//!     [exclusive queue] --> Subscriber --> EventRouter --> ReplicaApplier --> SQLite
//! ```
//!
//! ## Configuration
//! - REPLICATOR_CONFIG: Path to a YAML config file (optional)
//! - REPLICATOR_SERVICE__ROLE: customers | orders | products (default: orders)
//! - REPLICATOR_BROKER__URL: AMQP URL
//! - REPLICATOR_LOG: tracing filter (default: info)

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info};

use replicator::bus::AmqpConsumerTransport;
use replicator::config::Config;
use replicator::health::serve_health;
use replicator::replica::ReplicaApplier;
use replicator::storage::{open_pool, ReplicaSchema, ReplicaStore, SqliteReplicaStore};
use replicator::utils::bootstrap::{init_tracing, shutdown_signal};
use replicator::{EventRouter, Subscriber, SubscriberConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let role = config.service.role;

    let schemas: Vec<ReplicaSchema> = role
        .replicated_entities()
        .into_iter()
        .map(ReplicaSchema::for_entity)
        .collect();

    let store = SqliteReplicaStore::new(open_pool(&config.storage).await?);
    store.init(&schemas).await?;
    let store: Arc<dyn ReplicaStore> = Arc::new(store);

    let router = schemas.into_iter().fold(EventRouter::new(), |router, schema| {
        router.with_handler(Arc::new(ReplicaApplier::new(schema, Arc::clone(&store))))
    });

    let subscriber_config = SubscriberConfig::from_broker(&config.broker, &config.service);
    info!(
        role = %role.as_str(),
        bindings = ?subscriber_config.topology.bindings,
        "Replicator starting"
    );

    let transport = Arc::new(AmqpConsumerTransport::new(&config.broker));
    let subscriber = Subscriber::new(transport, Arc::new(router), subscriber_config).spawn();

    let (health_stop, health_stop_rx) = oneshot::channel::<()>();
    let health = if config.health.enabled {
        let health_config = config.health.clone();
        let state = subscriber.state_receiver();
        Some(tokio::spawn(async move {
            serve_health(&health_config, state, async {
                let _ = health_stop_rx.await;
            })
            .await
        }))
    } else {
        None
    };

    shutdown_signal().await;
    info!("Shutdown requested");

    subscriber.stop().await;
    let _ = health_stop.send(());

    if let Some(health) = health {
        match health.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Health server failed"),
            Err(e) => error!(error = %e, "Health server task failed"),
        }
    }

    info!("Replicator stopped");
    Ok(())
}
