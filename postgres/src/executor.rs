//! Retrying transaction executor.
//!
//! [`TxExecutor::run_tx`] runs a closure inside a database transaction and
//! owns the whole failure policy: classify the error, retry transient
//! failures with exponential backoff, report connection issues to the
//! circuit breaker, and fail fast while the breaker is open. Callers only
//! see their domain result or a [`TxError`].

use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use tablehold_runtime::metrics::TxMetrics;
use tablehold_runtime::{CircuitBreaker, RetryPolicy};

use crate::classify::classify;

/// Future returned by transaction work closures.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'c>>;

/// Errors surfaced by [`TxExecutor::run_tx`].
#[derive(Error, Debug)]
pub enum TxError {
    /// The circuit breaker rejected the call or opened during it.
    #[error("database unavailable: circuit breaker is open")]
    Unavailable,
    /// A storage error that was not retryable, or survived all retries.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Runs transactional work with retries under circuit-breaker protection.
///
/// One executor is shared by every service that talks to the database; it
/// is cheap to clone (pool handle plus `Arc`s).
#[derive(Clone)]
pub struct TxExecutor {
    pool: PgPool,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl TxExecutor {
    /// Create an executor over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool, policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            pool,
            policy,
            breaker,
        }
    }

    /// The underlying pool, for migrations and health checks.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `work` inside one transaction per attempt.
    ///
    /// Each attempt gets a fresh `BEGIN`; a successful closure result is
    /// committed, a failed one rolled back. Retryable failures
    /// (serialization, deadlock, connection) are retried up to
    /// `max_retries` times with backoff; connection failures are reported
    /// to the breaker and turn into [`TxError::Unavailable`] once it opens.
    ///
    /// `name` labels log lines; `read_only` issues `SET TRANSACTION READ
    /// ONLY` so the server can reject accidental writes.
    ///
    /// # Errors
    ///
    /// [`TxError::Unavailable`] when the breaker rejects the call or opens
    /// during it; [`TxError::Storage`] for non-retryable errors and for
    /// retryable ones that exhausted the budget.
    pub async fn run_tx<T, F>(&self, name: &str, read_only: bool, work: F) -> Result<T, TxError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> TxFuture<'c, T> + Send + Sync,
    {
        if !self.breaker.is_call_permitted() {
            tracing::warn!(tx = name, "circuit breaker open, rejecting transaction");
            TxMetrics::record_rejection();
            return Err(TxError::Unavailable);
        }

        let started = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            match self.attempt(read_only, &work).await {
                Ok(value) => {
                    self.breaker.on_success();
                    TxMetrics::record_duration(started.elapsed());
                    return Ok(value);
                }
                Err(e) => {
                    let cls = classify(&e);
                    if cls.is_connection_issue && self.breaker.on_connection_failure() {
                        tracing::warn!(
                            tx = name,
                            error = %e,
                            "circuit breaker opened, failing fast"
                        );
                        TxMetrics::record_failure();
                        return Err(TxError::Unavailable);
                    }
                    if cls.retryable && attempt <= self.policy.max_retries {
                        let delay = self.policy.delay_for_attempt(attempt);
                        tracing::warn!(
                            tx = name,
                            attempt,
                            reason = cls.reason.label(),
                            delay = ?delay,
                            error = %e,
                            "transient storage failure, retrying"
                        );
                        TxMetrics::record_retry();
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    if cls.retryable {
                        tracing::error!(
                            tx = name,
                            attempts = attempt,
                            reason = cls.reason.label(),
                            error = %e,
                            "transaction failed after exhausting retries"
                        );
                    } else {
                        tracing::error!(
                            tx = name,
                            reason = cls.reason.label(),
                            error = %e,
                            "transaction failed with non-retryable error"
                        );
                    }
                    TxMetrics::record_failure();
                    return Err(TxError::Storage(e));
                }
            }
        }
    }

    async fn attempt<T, F>(&self, read_only: bool, work: &F) -> Result<T, sqlx::Error>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> TxFuture<'c, T> + Send + Sync,
    {
        let mut tx = self.pool.begin().await?;
        if read_only {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await?;
        }
        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::debug!(error = %rollback_err, "rollback after failed attempt failed");
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for TxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxExecutor")
            .field("policy", &self.policy)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tablehold_core::{Clock, ManualClock};
    use tablehold_runtime::CircuitBreakerConfig;

    #[tokio::test]
    async fn open_breaker_rejects_without_touching_storage() {
        // A lazy pool never connects unless a transaction begins, so this
        // test passes only if the rejection happens before any storage work.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unreachable")
            .expect("lazy pool");
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new("2026-01-01T00:00:00Z".parse().unwrap()));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::builder().failure_threshold(1).build(),
            clock,
        ));
        assert!(breaker.on_connection_failure(), "threshold 1 opens at once");

        let executor = TxExecutor::new(pool, RetryPolicy::default(), breaker);
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let result: Result<(), TxError> = executor
            .run_tx("noop", false, move |_conn| {
                flag.store(true, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            })
            .await;

        assert!(matches!(result, Err(TxError::Unavailable)));
        assert!(
            !called.load(Ordering::SeqCst),
            "work must not run while the circuit is open"
        );
    }
}
