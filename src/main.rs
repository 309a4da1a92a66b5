#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use sigrelay::config::{Args, ServerConfig};
use sigrelay::metrics::{start_metrics_server, HealthState};
use sigrelay::registry::Registry;
use sigrelay::run;
use sigrelay::server::ServerState;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let metrics_addr = config.metrics_addr;
    let listen = config.listen;

    let state = Arc::new(ServerState {
        registry: Registry::new(),
        config,
        active_connections: AtomicUsize::new(0),
    });

    let listener = TcpListener::bind(listen).await?;
    info!("bound to {}", listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::select! {
        result = run(listener, state) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}
