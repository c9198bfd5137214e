/*!
VIGIL AGGREGATOR - central telemetry receiver

Tracks one durable session per agent, runs spike detection on every reading
and sends alerts back to the originating agent. Agent connect/disconnect is
observed through retained presence messages (Last Will on ungraceful loss).
Exposes a read-only status API over HTTP.
*/

mod cli;
mod config;
mod health;
mod http;
mod mqtt;
mod router;
mod state;

use crate::cli::Args;
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::mqtt::Dispatcher;
use crate::router::AggregatorRouter;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vigil_core::transport::{MqttSettings, MqttTransport};
use vigil_core::{topics, DurableStore, SessionRecord, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut cfg = load_config(args.config.as_deref()).await;
    if let Some(port) = args.port {
        cfg.mqtt.port = port;
    }

    // durable sessions
    let store = Arc::new(DurableStore::<SessionRecord>::load(cfg.state_path.clone()).await);
    for (agent_id, record) in store.snapshot().await {
        info!(%agent_id, sent = record.messages_sent, received = record.messages_received, "restored session");
    }

    let health = HealthTracker::new();
    let (transport, events) = MqttTransport::new(&cfg.mqtt.client_id, MqttSettings::default());
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let router = Arc::new(AggregatorRouter::new(store, cfg.detector(), Arc::clone(&transport), health.clone()));

    // broker link: the first connection is the only one allowed to fail hard
    let endpoint = cfg.endpoint();
    let subscriptions = vec![topics::PRESENCE_FILTER.to_string(), cfg.telemetry_topic.clone()];
    mqtt::connect_and_subscribe(transport.as_ref(), &endpoint, &subscriptions)
        .await
        .with_context(|| format!("Failed to connect to broker at {endpoint}"))?;
    health.mark_mqtt_connected();
    info!(%endpoint, "📡 listening for agents");

    let dispatcher = Dispatcher::new(Arc::clone(&router), cfg.telemetry_topic.clone(), health.clone());
    let listener = mqtt::spawn_mqtt_listener(
        Arc::clone(&transport),
        events,
        endpoint,
        subscriptions,
        dispatcher,
        health.clone(),
    );

    if cfg.http.enabled {
        let app = http::build_router(AppState { router, health });
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {addr}"))?;
        info!("status API on http://{addr}");
        axum::serve(tcp, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")?;
    } else {
        shutdown_signal().await;
    }

    info!("🛑 shutting down");
    listener.abort();
    if let Err(e) = transport.disconnect().await {
        warn!(error = %e, "broker disconnect failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
