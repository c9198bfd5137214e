//! Vigil Fleet - simulated telemetry agents
//!
//! Drives N agents against the broker:
//! - Staggered connect, fail-together provisioning
//! - Parallel streaming of sensor readings on the telemetry topic
//! - Failover reconnection with endpoint rotation and a persisted reconnect log
//! - Parallel teardown and a final report

mod cli;
mod config;
mod error;
mod fleet;
mod reconnect;
mod sensor;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Args;
use config::FleetConfig;
use error::FleetError;
use fleet::FleetOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vigil_core::transport::MqttTransportFactory;
use vigil_core::DurableStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = FleetConfig::load(args.config.as_deref()).await?;
    config.apply_args(&args);
    config.validate().context("Invalid fleet configuration")?;

    info!("🤖 Vigil fleet starting...");
    info!(
        broker = %config.broker.host,
        ports = ?config.broker.ports,
        agents = config.fleet.agents,
        messages = config.fleet.messages,
        interval_ms = config.fleet.interval_ms,
        "configuration"
    );

    let reconnect_log = Arc::new(DurableStore::load(config.reconnect.log_path.clone()).await);
    let factory = Arc::new(MqttTransportFactory { settings: config.mqtt_settings(), presence_will: true });
    let mut fleet = FleetOrchestrator::new(config.fleet_settings(), factory, reconnect_log);

    // Graceful shutdown via Ctrl+C
    let shutdown_token = fleet.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, stopping streams...");
        shutdown_token.cancel();
    });

    let outcome = run(&mut fleet, &config).await;

    // Agents that did connect are torn down whatever happened before
    let report = fleet.teardown_all().await;
    report.log_summary();

    outcome.context("Fleet run failed")
}

async fn run(fleet: &mut FleetOrchestrator, config: &FleetConfig) -> Result<(), FleetError> {
    let cancel = fleet.cancel_token();

    fleet.provision(config.fleet.agents).await?;
    settle(&cancel, Duration::from_secs(1)).await;

    fleet.stream_all(&config.fleet.topic, config.interval(), config.fleet.messages).await;

    // Let in-flight alerts come back before reporting
    settle(&cancel, Duration::from_secs(2)).await;
    fleet.display_stats();
    Ok(())
}

async fn settle(cancel: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
