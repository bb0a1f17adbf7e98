//! Carousel Proxy Bridge - Entry Point
//!
//! Starts the client-facing bridge listener and both upgrade listeners with
//! graceful shutdown support.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod models;
mod proxy;

use config::{Cli, Config};
use proxy::rotation::RotationPools;
use proxy::server::BridgeServer;

#[tokio::main]
async fn main() -> error::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.debug {
        "carousel=debug"
    } else {
        "carousel=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(env = %cli.env, "Starting Carousel Proxy Bridge");

    // Validate the command line and load endpoint pools
    let config = Config::from_cli(cli)?;
    info!("Configuration loaded, backend type: {}", config.backend);

    let pools = Arc::new(RotationPools::new(
        config.relays.clone(),
        config.proxies.clone(),
    ));
    info!(
        "Loaded {} relay endpoints and {} proxy endpoints",
        pools.relay_count(),
        pools.proxy_count()
    );

    // Bind all listeners before accepting traffic
    let server = BridgeServer::bind(&config, pools).await?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Bridge server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;

    info!("Carousel Proxy Bridge stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
