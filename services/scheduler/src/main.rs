//! hydromaas scheduler
//!
//! Accepts model execution jobs over HTTP and drives them through resource
//! allocation and launch in a periodic control loop.

use std::sync::Arc;

use anyhow::Result;
use hydromaas_scheduler::{
    api,
    config::{self, StoreKind},
    db::Database,
    jobs::{JobManager, JobStore, SchedulerWorker},
    launcher::{HttpLauncher, Launcher, MockLauncher},
    resources::ResourceManager,
    state::AppState,
    store::{Keys, KeyValueStore, LeaseLock, MemoryStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to HYDROMAAS_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hydromaas scheduler");
    info!(listen_addr = %config.listen_addr, store = ?config.store, "Configuration loaded");

    let store: Arc<dyn KeyValueStore> = match config.store {
        StoreKind::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Arc::new(db.record_store())
        }
        StoreKind::Memory => {
            warn!("Using in-memory store; state is not shared and is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let scheduler = &config.scheduler;
    let keys = Keys::new(scheduler.key_prefix.clone());
    let resources = ResourceManager::new(store.clone(), keys.clone(), scheduler.resource_pool.clone());

    if let Some(path) = &config.fleet_file {
        let fleet = config::load_fleet(path)?;
        resources.add_resources(&fleet).await?;
        info!(path = %path.display(), nodes = fleet.len(), "Registered fleet");
    }

    let launcher: Arc<dyn Launcher> = match &config.launcher_url {
        Some(url) => {
            info!(url = %url, "Using HTTP launcher");
            Arc::new(HttpLauncher::new(url.clone())?)
        }
        None => {
            warn!("No launcher URL configured; using mock launcher");
            Arc::new(MockLauncher::new())
        }
    };

    let manager = Arc::new(
        JobManager::new(JobStore::new(store.clone(), keys.clone()), resources, launcher)
            .with_grouping(scheduler.asset_grouping)
            .with_policy(scheduler.queue_policy.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lock = LeaseLock::new(store.clone(), keys.active_jobs_lock(), scheduler.lock_lease);
    let worker = SchedulerWorker::new(
        manager.clone(),
        lock,
        scheduler.tick_interval,
        scheduler.lock_retry,
    );
    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(manager));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for the control loop to stop");
    if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(10), worker_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
