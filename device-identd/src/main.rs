mod config;
mod catalog;
mod host;
mod host_manager;
mod store;
mod ssdp;
mod api;

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::types::DeviceProfileMap;
use crate::config::Config;
use crate::host_manager::HostHandle;
use crate::store::db::HostDb;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("device_identd=info"))
        )
        .init();

    tracing::info!("Starting device-identd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/device-ident/identd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite database
    let db = HostDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    // A missing catalog leaves every host unmatched until it is reloaded
    let catalog = match catalog::load_catalog(&config.catalog.path) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::warn!("Starting with an empty device profile catalog: {:#}", e);
            DeviceProfileMap::new()
        }
    };

    // Start host thread; it publishes the initial hash itself
    let (hash_tx, hash_rx) = watch::channel(String::new());
    let (location_tx, location_rx) = mpsc::channel(64);
    let host_handle = HostHandle::spawn(db, catalog, config.cache.clone(), hash_tx, location_tx);
    tracing::info!("Initial device hash: {}", hash_rx.borrow().as_str());

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn SSDP location fetcher
    let (event_tx, event_rx) = mpsc::channel(1024);
    let fetcher_cancel = cancel.clone();
    let fetcher_tx = event_tx.clone();
    let fetcher_config = config.ssdp.clone();
    let fetcher_handle = tokio::spawn(async move {
        if let Err(e) = ssdp::location::run_fetcher(location_rx, fetcher_tx, fetcher_config, fetcher_cancel).await {
            tracing::error!("SSDP location fetcher error: {}", e);
        }
    });

    // Spawn host manager task
    let mgr_cancel = cancel.clone();
    let mgr_config = config.cache.clone();
    let mgr_hosts = host_handle.clone();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = host_manager::run(mgr_hosts, event_rx, mgr_config, mgr_cancel).await {
            tracing::error!("Host manager error: {}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        hosts: host_handle.clone(),
        hash_rx,
        catalog_path: Arc::new(config.catalog.path.clone()),
        event_tx,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = tokio::join!(fetcher_handle, mgr_handle, server_handle);

    // Persist the latest seen timestamps before the host thread goes away
    if let Err(e) = host_handle.maintenance(false).await {
        tracing::error!("Failed to persist hosts: {}", e);
    }

    if let Err(e) = host_handle.shutdown().await {
        tracing::error!("Failed to shutdown host thread: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
