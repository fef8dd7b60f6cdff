//! Tablehold worker binary.
//!
//! Runs the outbox delivery worker and the hold-expiry sweeper against one
//! database, with a Prometheus endpoint for scraping. Configuration comes
//! from the environment:
//!
//! - `DATABASE_URL` (required), `DELIVERY_ENDPOINT` (required)
//! - `METRICS_ADDR` (default `0.0.0.0:9090`)
//! - `DB_TX_*`, `DB_BREAKER_*`, `OUTBOX_*`, `HOLD_SWEEP_INTERVAL_MS`

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tablehold_core::{Clock, SystemClock};
use tablehold_postgres::{MIGRATOR, PgOutboxStore, TxExecutor};
use tablehold_runtime::metrics::{MetricsServer, OutboxMetrics};
use tablehold_runtime::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use tablehold_worker::{
    HoldSweeper, HttpDeliveryPort, OutboxWorker, OutboxWorkerConfig, SweeperConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let delivery_endpoint =
        std::env::var("DELIVERY_ENDPOINT").context("DELIVERY_ENDPOINT must be set")?;
    let metrics_addr = std::env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".into());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to the database")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let mut metrics_server = MetricsServer::new(
        metrics_addr
            .parse()
            .context("METRICS_ADDR must be a socket address")?,
    );
    metrics_server.start()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::from_env(),
        Arc::clone(&clock),
    ));
    let executor = TxExecutor::new(pool.clone(), RetryPolicy::from_env("DB_TX"), breaker);

    let gauge_store = PgOutboxStore::new(pool.clone(), Arc::clone(&clock));
    let store = PgOutboxStore::new(pool, Arc::clone(&clock));
    let delivery =
        HttpDeliveryPort::new(delivery_endpoint).context("failed to build HTTP client")?;
    let outbox_worker = OutboxWorker::new(
        store,
        delivery,
        OutboxWorkerConfig::from_env(),
        Arc::clone(&clock),
    );
    let sweeper = HoldSweeper::new(executor, clock, SweeperConfig::from_env());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { outbox_worker.run(shutdown).await })
    };
    let gauge_handle = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match gauge_store.count_pending().await {
                    Ok(pending) => OutboxMetrics::record_pending(pending),
                    Err(e) => tracing::warn!(error = %e, "failed to count pending outbox messages"),
                }
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
                }
            }
        })
    };
    let sweeper_handle = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = worker_handle.await;
    let _ = gauge_handle.await;
    let _ = sweeper_handle.await;
    tracing::info!("worker shut down cleanly");
    Ok(())
}
