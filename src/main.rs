//! Try-on gateway server binary.
//!
//! Wires configuration, logging, the idle sweeper and the observability
//! endpoint, then runs the WebSocket accept loop until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tryon_bridge::channel::GrpcInferenceChannel;
use tryon_bridge::config::GatewayConfig;
use tryon_bridge::http;
use tryon_bridge::metrics::BridgeMetrics;
use tryon_bridge::registry::{IdleSweeper, SessionRegistry};
use tryon_bridge::server::BridgeServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting try-on session bridge");

    let config = GatewayConfig::default();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown signal received");
                    let _ = shutdown_tx.send(());
                }
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
        });
    }

    let metrics = BridgeMetrics::new();
    let prometheus = Arc::new(prometheus::Registry::new());
    metrics.register(&prometheus);

    let registry = Arc::new(SessionRegistry::new(metrics.clone()));
    let channel = Arc::new(GrpcInferenceChannel::new(
        config.channel_config(),
        metrics.clone(),
    )?);

    // Keep the guard alive for the lifetime of the process; dropping it
    // would stop the sweep loop.
    let _sweeper_guard = IdleSweeper::new(registry.clone())
        .with_max_idle(config.max_idle)
        .with_interval(config.sweep_interval)
        .start();

    let http_addr: SocketAddr = config.http_addr.parse()?;
    let http_router = http::router(registry.clone(), prometheus.clone());
    tokio::spawn(async move {
        let listener = match TcpListener::bind(http_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %http_addr, error = %e, "Failed to bind observability endpoint");
                return;
            }
        };
        info!(addr = %http_addr, "Observability endpoint listening");
        if let Err(e) = axum::serve(listener, http_router).await {
            error!(error = %e, "Observability server error");
        }
    });

    let ws_addr: SocketAddr = config.ws_addr.parse()?;
    let listener = TcpListener::bind(ws_addr).await?;
    let server = Arc::new(BridgeServer::new(config, registry, channel, metrics));
    server.serve(listener, shutdown_tx.subscribe()).await;

    info!("Session bridge stopped");
    Ok(())
}
