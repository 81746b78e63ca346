//! CashPong Server - Authoritative staked pong backend
//!
//! This is the main entry point for the game server. It handles:
//! - WebSocket connections for real-time gameplay
//! - Ledger webhook events that open and populate rooms
//! - The 60 Hz authoritative match simulation
//! - Winner declaration back to the staking ledger

mod app;
mod arbiter;
mod config;
mod game;
mod http;
mod input;
mod ledger;
mod registry;
mod rooms;
mod util;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::http::build_router;
use crate::ledger::client::HttpLedger;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting CashPong Server");
    info!("Server address: {}", config.server_addr);

    // Create application state with the HTTP ledger client
    let sink = Arc::new(HttpLedger::new(&config));
    let state = AppState::new(config, sink);

    // Periodic stats heartbeat
    tokio::spawn(heartbeat(state.clone()));

    // Build router
    let router = build_router(state.clone());

    // Start server
    let addr: SocketAddr = state.config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Log a liveness line with the headline gauges every 30 seconds
async fn heartbeat(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        info!(
            connected_players = state.registry.connected_players(),
            idle_connections = state.registry.idle_connections(60_000),
            open_rooms = state.rooms.open_rooms(),
            active_matches = state.matches.active_matches(),
            "Server heartbeat"
        );
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
