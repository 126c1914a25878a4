//! gRPC health endpoint driven by subscriber state.
//!
//! Two entries are reported:
//! - `""` (overall): Serving while the subscriber task is alive
//! - `replicator.subscriber`: Serving only while a session is consuming

use std::future::Future;
use std::net::SocketAddr;

use tokio::sync::watch;
use tonic::transport::Server;
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::subscriber::SubscriberState;

/// Health entry for the consume loop.
pub const SUBSCRIBER_SERVICE: &str = "replicator.subscriber";

pub fn liveness(state: SubscriberState) -> ServingStatus {
    match state {
        SubscriberState::Connecting | SubscriberState::Consuming => ServingStatus::Serving,
        SubscriberState::Stopped => ServingStatus::NotServing,
    }
}

pub fn readiness(state: SubscriberState) -> ServingStatus {
    match state {
        SubscriberState::Consuming => ServingStatus::Serving,
        SubscriberState::Connecting | SubscriberState::Stopped => ServingStatus::NotServing,
    }
}

/// Mirror subscriber state into the health reporter until it stops.
pub async fn watch_subscriber(
    mut reporter: HealthReporter,
    mut state: watch::Receiver<SubscriberState>,
) {
    loop {
        let current = *state.borrow_and_update();
        debug!(state = ?current, "Subscriber state changed");
        reporter.set_service_status("", liveness(current)).await;
        reporter
            .set_service_status(SUBSCRIBER_SERVICE, readiness(current))
            .await;

        if current == SubscriberState::Stopped || state.changed().await.is_err() {
            break;
        }
    }

    // Sender gone means the task is gone, whatever the last state was.
    reporter
        .set_service_status("", ServingStatus::NotServing)
        .await;
    reporter
        .set_service_status(SUBSCRIBER_SERVICE, ServingStatus::NotServing)
        .await;
}

/// Serve the health service until `shutdown` resolves.
pub async fn serve_health<F>(
    config: &HealthConfig,
    state: watch::Receiver<SubscriberState>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send,
{
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (reporter, health_service) = health_reporter();
    let watcher = tokio::spawn(watch_subscriber(reporter, state));

    info!(address = %addr, "Health server listening");
    let result = Server::builder()
        .add_service(health_service)
        .serve_with_shutdown(addr, shutdown)
        .await;

    watcher.abort();
    result?;
    Ok(())
}
