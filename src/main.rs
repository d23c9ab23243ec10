use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use satellite_bridge::adapters::http::{self, HealthComposite};
use satellite_bridge::adapters::satellite::SatelliteAdapter;
use satellite_bridge::adapters::websocket::ClientServer;
use satellite_bridge::application::{MessageRouter, RouterConfig};
use satellite_bridge::cli::Cli;
use satellite_bridge::config::BridgeConfig;
use satellite_bridge::domain::foundation::{SequenceRegistry, SystemClock};
use satellite_bridge::domain::state::StateStore;
use satellite_bridge::domain::subscription::SubscriptionManager;
use satellite_bridge::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {err}");
        return ExitCode::FAILURE;
    }
    if cli.validate {
        println!("configuration OK");
        return ExitCode::SUCCESS;
    }

    telemetry::init_tracing(&config.observability.log_level);
    telemetry::register_metrics();
    info!(version = env!("CARGO_PKG_VERSION"), "satellite-bridge starting");

    let clock = SystemClock::shared();
    let store = Arc::new(StateStore::new(clock.clone()));
    let subscriptions = Arc::new(SubscriptionManager::new(clock.clone()));
    let sequences = Arc::new(SequenceRegistry::new());
    let router = MessageRouter::new(store, subscriptions, sequences, clock, RouterConfig::default());

    let adapter = SatelliteAdapter::new(config.companion.clone(), router.clone());
    if let Err(err) = router.register_target(adapter.clone()) {
        error!(error = %err, "adapter registration failed");
        return ExitCode::FAILURE;
    }
    adapter.start();

    let server = ClientServer::new(config.server.clone(), router.clone());
    if let Err(err) = server.start().await {
        error!(error = %err, "client transport failed to start");
        return ExitCode::FAILURE;
    }

    let mut health = HealthComposite::new();
    health.register(adapter.clone());
    let observability = match http::serve(&config.observability, Arc::new(health)).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "observability endpoints failed to start");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "signal handler failed");
    }
    info!("shutting down");

    server.stop().await;
    adapter.stop().await;
    router.shutdown().await;
    observability.abort();

    ExitCode::SUCCESS
}
