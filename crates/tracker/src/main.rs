//! voltrack - storage-object history tracker
//!
//! Watches a cluster control plane for pod, persistent volume, and
//! persistent volume claim events and materializes a queryable history
//! of which containers mounted which storage backends, and when.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracker_lib::{
    watch::ApiClient, HealthRegistry, ResourceKind, SqliteStore, Store, Supervisor,
    TrackerMetrics,
};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting voltrack");

    let config = config::TrackerConfig::load()?;
    info!(
        feed = %config.feed_addr,
        namespace = %config.namespace,
        db = %config.db_path,
        "Tracker configured"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("unable to open database at {}", config.db_path))?,
    );
    store
        .validate()
        .await
        .context("database connection check failed")?;

    let _metrics = TrackerMetrics::new();
    let health = HealthRegistry::new();

    let client = Arc::new(ApiClient::new(&config.feed_addr)?);
    let mut supervisor = Supervisor::new(
        client,
        store as Arc<dyn Store>,
        config.namespace.clone(),
        health.clone(),
    );

    for kind in ResourceKind::all() {
        supervisor.watch(kind, config.initialize).await;
    }
    health.set_ready(true).await;

    let state = Arc::new(api::AppState::new(health.clone()));
    tokio::spawn(api::serve(config.api_port, state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    supervisor.destroy().await;

    Ok(())
}
