// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use venue_gate_server::{
    api::router,
    clock::{Clock, SystemClock},
    config::{
        ServiceConfig, DEFAULT_LOG_FILTER, IDEMPOTENCY_RETENTION, LEDGER_SWEEP_INTERVAL,
        LOG_FORMAT_ENV,
    },
    notifications::{LogSink, NotificationQueue, NotificationWorker},
    state::AppState,
    storage::{KeyValueStore, MemoryStore, VenueDatabase},
    webhook::ledger::LedgerSweeper,
};

/// Entries held by the in-process lock and rate-limit store.
const CACHE_CAPACITY: usize = 100_000;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ServiceConfig::from_env()?;
    tracing::info!(
        environment = ?config.environment,
        data_dir = %config.data_dir.display(),
        allowed_sources = config.webhook.allowed_sources.len(),
        "Loaded configuration"
    );
    if config.environment.is_production() && config.webhook.allowed_sources.is_empty() {
        tracing::warn!("No gateway source addresses configured; all webhooks will be refused");
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(VenueDatabase::open(&config.database_path())?);
    let cache: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(CACHE_CAPACITY));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let shutdown = CancellationToken::new();

    let (queue, jobs) = NotificationQueue::channel();
    let worker = NotificationWorker::new(jobs, Arc::new(LogSink));
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let sweeper = LedgerSweeper::new(
        Arc::clone(&db),
        Arc::clone(&clock),
        IDEMPOTENCY_RETENTION,
        LEDGER_SWEEP_INTERVAL,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    let state = AppState::new(&config, db, cache, clock, queue);
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Venue gate server listening on http://{addr} (docs at /docs)");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    let (worker, sweeper) = tokio::join!(worker_handle, sweeper_handle);
    if let Err(e) = worker {
        tracing::error!(error = %e, "Notification worker did not shut down cleanly");
    }
    if let Err(e) = sweeper {
        tracing::error!(error = %e, "Ledger sweeper did not shut down cleanly");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping server...");
    shutdown.cancel();
}
