//! Peerlink relay server.
//!
//! An axum WebSocket server that assigns every connection an ephemeral
//! session id and broadcasts admitted envelopes to all live sessions. It
//! also serves a health check and a static file tree.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8080
//! cargo run --bin peerlink-relay
//!
//! # Run on a custom port with a different asset root
//! cargo run --bin peerlink-relay -- --port 9000 --static-dir ./public
//!
//! # Or via environment variables
//! PORT=9000 STATIC_DIR=./public cargo run --bin peerlink-relay
//! ```

use clap::Parser;
use peerlink_relay::config::{RelayCliArgs, RelayConfig};
use peerlink_relay::hub::HubHandle;
use peerlink_relay::server::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let bind_addr = config.bind_addr();
    tracing::info!(
        addr = %bind_addr,
        static_dir = %config.static_dir.display(),
        relay_signaling = config.session.relay_signaling,
        "starting peerlink relay server"
    );

    let state = RelayState::new(config.session.clone());
    let shutdown = shutdown_signal(state.hub.clone());

    match server::start_server_with_shutdown(&bind_addr, state, &config.static_dir, shutdown).await
    {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
            tracing::info!("shutdown complete");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}

/// Resolves on Ctrl+C after asking every session to close.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("received shutdown signal, closing sessions");
    if hub.close_all().await.is_err() {
        tracing::warn!("hub already stopped");
    }
}
