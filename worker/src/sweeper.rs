//! Periodic removal of expired holds.
//!
//! Expired holds are already invisible to the booking service (every read
//! checks `expires_at`), so the sweep is pure hygiene: it keeps the slot
//! unique index meaningful and the table small.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use tablehold_core::Clock;
use tablehold_postgres::{TxError, TxExecutor, holds};
use tablehold_runtime::metrics::SweeperMetrics;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl SweeperConfig {
    /// Read a configuration from the environment (`HOLD_SWEEP_INTERVAL_MS`)
    /// with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            interval: std::env::var("HOLD_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(DEFAULT_SWEEP_INTERVAL, Duration::from_millis),
        }
    }
}

/// Deletes expired holds on a fixed interval.
pub struct HoldSweeper {
    executor: TxExecutor,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl HoldSweeper {
    /// Create a sweeper.
    #[must_use]
    pub fn new(executor: TxExecutor, clock: Arc<dyn Clock>, config: SweeperConfig) -> Self {
        Self {
            executor,
            clock,
            config,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.config.interval, "hold sweeper started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "hold sweep failed");
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }
        tracing::info!("hold sweeper stopped");
    }

    /// Delete every expired hold. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Propagates [`TxError`] from the executor.
    pub async fn sweep_once(&self) -> Result<u64, TxError> {
        let clock = Arc::clone(&self.clock);
        let removed = self
            .executor
            .run_tx("holds.sweep", false, move |conn| {
                let clock = Arc::clone(&clock);
                Box::pin(async move { holds::delete_expired(conn, clock.now()).await })
            })
            .await?;
        if removed > 0 {
            tracing::info!(removed, "expired holds swept");
            SweeperMetrics::record_expired(removed);
        }
        Ok(removed)
    }
}
