//! Tether Master
//!
//! Accepts job definitions over HTTP, dispatches executions to worker nodes
//! over long-lived streams and tracks their progress.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Store: File-backed job definitions, execution details and logs
//! - Service: Node registry/dispatcher and the master engine
//! - Transport: Worker connections and inbound message routing
//! - API: HTTP endpoints for callers

mod api;
mod config;
mod service;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use tether_core::store::{FileJobStore, JobStore};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::service::engine::MasterEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_master=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tether Master...");

    let config = load_config()?;
    info!(
        "Loaded configuration: http_addr={}, transport_addr={}, data_dir={}",
        config.http_addr,
        config.transport_addr,
        config.data_dir.display()
    );

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(config.data_dir.clone()));
    let engine = MasterEngine::start(config.clone(), store);

    // Worker streams
    let transport = TcpListener::bind(&config.transport_addr)
        .await
        .with_context(|| format!("Failed to bind transport to {}", config.transport_addr))?;
    let transport_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = transport::serve(transport, transport_engine).await {
            error!("Transport server stopped: {}", e);
        }
    });

    // Build router with all API endpoints
    let app = api::create_router(engine);

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API to {}", config.http_addr))?;
    info!("Listening on {}", config.http_addr);

    axum::serve(listener, app)
        .await
        .context("HTTP server failed")?;

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
