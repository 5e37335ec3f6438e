//! Tether Worker
//!
//! A worker node that runs job executions on behalf of the master.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Client: The stream to the master, with register and reconnect
//! - Engine: Routes master requests and reports progress back
//! - Executor: Stage scheduling, step lifecycle, timeouts and cancellation
//! - Actions: What a step actually does (shell scripts, workdir changes)
//!
//! The worker keeps one stream open to the master, runs every execution it is
//! handed concurrently and streams logs back periodically.

mod action;
mod client;
mod config;
mod context;
mod engine;
mod executor;
mod output;

use std::sync::Arc;

use anyhow::Result;
use tether_core::domain::node::Node;
use tether_core::store::{FileJobStore, JobStore};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::action::ActionRegistry;
use crate::client::MasterClient;
use crate::config::Config;
use crate::engine::WorkerEngine;
use crate::executor::{Executor, ExecutorSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tether Worker");

    let config = load_config()?;
    info!(
        "Loaded configuration: name={}, master_addr={}, data_dir={}",
        config.name,
        config.master_addr,
        config.data_dir.display()
    );

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(config.data_dir.join("store")));
    let executor = Arc::new(Executor::new(
        store,
        ActionRegistry::new(),
        ExecutorSettings {
            workspace: config.data_dir.join("workdir"),
            step_timeout: config.step_timeout,
            snapshot_interval: config.snapshot_interval,
        },
    ));
    let watchdog = executor.spawn_watchdog(config.watchdog_interval);

    info!(
        "Step timeout: {:?}, Log send interval: {:?}",
        config.step_timeout, config.log_send_interval
    );

    let node = Node::new(config.name.clone(), config.address.clone());
    let client = MasterClient::new(config.master_addr.clone(), node.clone());
    let engine = WorkerEngine::new(config, node, executor);

    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_engine.shutdown();
        }
    });

    let outcome = engine.run(client).await;
    watchdog.abort();

    if let Err(e) = &outcome {
        error!("Worker stopped: {}", e);
    }
    outcome
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
