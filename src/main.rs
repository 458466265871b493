//! slchatd - single-instance front end.
//!
//! Serves the chat service over the JSON-lines gateway, backed by the
//! in-process store and bus.

use slchatd::config::Config;
use slchatd::network::{Gateway, MemoryTransport};
use slchatd::server::ChatServer;
use slchatd::state::MemoryStore;
use slchatd::sync::BusHub;
use slchatd::{http, metrics};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Bus inbox depth of the instance.
const BUS_INBOX_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    let instance_id = config.server.resolve_instance_id();
    info!(
        instance = %instance_id,
        listen = %config.server.listen,
        direct_messages = config.service.enable_direct_messages,
        rooms_management = config.service.enable_rooms_management,
        "Starting slchatd"
    );

    // Convention: metrics_port = 0 disables the HTTP endpoint.
    match config.server.metrics_port {
        Some(port) if port != 0 => {
            metrics::init();
            info!("Metrics initialized");

            let http_instance = instance_id.clone();
            tokio::spawn(async move {
                http::run_http_server(port, http_instance).await;
            });
            info!(port, "Operator HTTP endpoint started");
        }
        _ => info!("Metrics disabled"),
    }

    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MemoryTransport::new(config.server.event_queue));
    let hub = BusHub::new();
    let (bus, inbox) = hub.attach(&instance_id, BUS_INBOX_CAPACITY);

    let server = Arc::new(ChatServer::new(
        config.service.clone(),
        store,
        transport.clone(),
        Arc::new(bus),
        inbox,
    ));

    // Consistency failures are logged where they are raised; keep a
    // subscriber so lagging shows up in the logs.
    {
        let mut events = server.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        tracing::debug!(event = event.name(), op = event.info().op, "Server event");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Server event subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let gateway = Gateway::bind(config.server.listen, server.clone(), transport).await?;

    tokio::select! {
        result = gateway.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            server.close().await;
        }
    }

    Ok(())
}
