//! status-list-service server entry point.
//!
//! Loads configuration and pools, connects the store, starts the per-pool
//! background workers and serves the REST and WebSocket endpoints until
//! Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use status_list_service::app_state::AppState;
use status_list_service::build_app;
use status_list_service::config::{ServiceConfig, StorageBackend, load_pools};
use status_list_service::domain::{EventBus, SharedClock, SystemClock};
use status_list_service::persistence::{MemoryStore, PostgresStore, SharedStore};
use status_list_service::service::StatusListService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    tracing::info!(addr = %config.listen_addr, "starting status-list-service");

    let pools = load_pools(&config.pools_config)
        .with_context(|| format!("loading pools from {}", config.pools_config.display()))?;

    let clock: SharedClock = Arc::new(SystemClock);
    let store: SharedStore = match config.storage_backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new(Arc::clone(&clock)))
        }
        StorageBackend::Postgres => {
            let store = PostgresStore::connect(&config).await?;
            store.migrate().await?;
            Arc::new(store)
        }
    };

    let event_bus = EventBus::new(config.event_bus_capacity);
    let service = Arc::new(
        StatusListService::build(&config, pools, store, event_bus, clock)
            .await
            .context("building status list service")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = service.spawn_workers(&shutdown_rx).await;

    let app = build_app(AppState::new(Arc::clone(&service)));

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    service.shutdown().await;
    tracing::info!("stopped");

    Ok(())
}
