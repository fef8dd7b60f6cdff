//! `PostgreSQL` outbox: transactional enqueue and the delivery-side store.
//!
//! [`enqueue`] takes the caller's live connection so the message commits or
//! rolls back together with the domain write that produced it. Everything
//! the delivery worker needs runs on [`PgOutboxStore`]'s own pool, outside
//! any domain transaction.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` plus a `claimed_until` lease:
//! concurrent workers skip rows another worker just locked, and a row whose
//! worker died becomes pickable again once its lease expires.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tablehold_core::{Clock, OutboxError, OutboxMessage, OutboxStatus, OutboxStore};

const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);

const MESSAGE_COLUMNS: &str = "id, topic, payload, status, attempts, next_attempt_at, last_error";

/// Enqueue a message on the caller's transaction.
///
/// The insert becomes visible to the worker if and only if the enclosing
/// transaction commits. Returns the message id.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn enqueue(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    topic: &str,
    payload: &Value,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO outbox_messages (
            topic, payload, status, attempts, next_attempt_at, created_at, updated_at
        ) VALUES ($1, $2, 'NEW', 0, $3, $3, $3)
        RETURNING id
        ",
    )
    .bind(topic)
    .bind(payload)
    .bind(now)
    .fetch_one(conn)
    .await?;

    tracing::debug!(outbox_id = id, topic = topic, "outbox message enqueued");
    Ok(id)
}

/// [`OutboxStore`] backed by `PostgreSQL`.
pub struct PgOutboxStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    claim_lease: Duration,
}

impl PgOutboxStore {
    /// Create a store with the default claim lease.
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Override the claim lease (how long a picked row stays invisible to
    /// other workers before it is assumed abandoned).
    #[must_use]
    pub const fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Count messages awaiting delivery, for health surfaces.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] when the query fails.
    pub async fn count_pending(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_messages WHERE status = 'NEW'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(count)
    }

    async fn exists(&self, id: i64) -> Result<bool, OutboxError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM outbox_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.is_some())
    }

    async fn claim(&self, topics: Option<&[String]>, limit: i64) -> Result<Vec<OutboxMessage>, OutboxError> {
        let now = self.clock.now();
        let lease_until = now + lease_chrono(self.claim_lease);

        let topic_filter = if topics.is_some() {
            " AND topic = ANY($4)"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE outbox_messages SET claimed_until = $1 \
             WHERE id IN ( \
                 SELECT id FROM outbox_messages \
                 WHERE status = 'NEW' \
                   AND next_attempt_at <= $2 \
                   AND (claimed_until IS NULL OR claimed_until <= $2) \
                   {topic_filter} \
                 ORDER BY id \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {MESSAGE_COLUMNS}"
        );

        let mut query = sqlx::query(&sql).bind(lease_until).bind(now).bind(limit);
        if let Some(topics) = topics {
            query = query.bind(topics);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(storage_err)?;
        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not promise an order; delivery follows id order.
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }
}

impl OutboxStore for PgOutboxStore {
    fn pick_batch(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>> {
        Box::pin(async move { self.claim(None, limit).await })
    }

    fn pick_batch_for_topics<'a>(
        &'a self,
        topics: &'a [String],
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + 'a>> {
        Box::pin(async move { self.claim(Some(topics), limit).await })
    }

    fn mark_sent(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now();
            let result = sqlx::query(
                "UPDATE outbox_messages \
                 SET status = 'SENT', attempts = attempts + 1, \
                     claimed_until = NULL, last_error = NULL, updated_at = $1 \
                 WHERE id = $2 AND status = 'NEW'",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

            if result.rows_affected() == 0 {
                // Either already terminal (idempotent no-op) or missing.
                if !self.exists(id).await? {
                    return Err(OutboxError::NotFound(id));
                }
            } else {
                tracing::debug!(outbox_id = id, "outbox message marked sent");
            }
            Ok(())
        })
    }

    fn mark_failed_with_retry<'a>(
        &'a self,
        id: i64,
        error: &'a str,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let result = sqlx::query(
                "UPDATE outbox_messages \
                 SET attempts = attempts + 1, next_attempt_at = $1, \
                     last_error = $2, claimed_until = NULL, updated_at = $3 \
                 WHERE id = $4 AND status = 'NEW'",
            )
            .bind(next_attempt_at)
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            tracing::warn!(
                outbox_id = id,
                next_attempt_at = %next_attempt_at,
                error = error,
                "outbox delivery failed, rescheduled"
            );
            Ok(())
        })
    }

    fn mark_failed_permanently<'a>(
        &'a self,
        id: i64,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let result = sqlx::query(
                "UPDATE outbox_messages \
                 SET status = 'FAILED', attempts = attempts + 1, \
                     last_error = $1, claimed_until = NULL, updated_at = $2 \
                 WHERE id = $3 AND status = 'NEW'",
            )
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

            if result.rows_affected() == 0 {
                // A stale worker reporting on a row another worker already
                // resolved must not rewrite the terminal status.
                if !self.exists(id).await? {
                    return Err(OutboxError::NotFound(id));
                }
                return Ok(());
            }
            tracing::warn!(
                outbox_id = id,
                error = error,
                "outbox message marked permanently failed"
            );
            Ok(())
        })
    }
}

impl std::fmt::Debug for PgOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgOutboxStore")
            .field("claim_lease", &self.claim_lease)
            .finish_non_exhaustive()
    }
}

fn storage_err(e: sqlx::Error) -> OutboxError {
    OutboxError::Storage(e.to_string())
}

fn lease_chrono(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, OutboxError> {
    let status_str: String = row
        .try_get("status")
        .map_err(storage_err)?;
    Ok(OutboxMessage {
        id: row.try_get("id").map_err(storage_err)?,
        topic: row.try_get("topic").map_err(storage_err)?,
        payload: row.try_get("payload").map_err(storage_err)?,
        status: OutboxStatus::parse(&status_str)?,
        attempts: row.try_get("attempts").map_err(storage_err)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(storage_err)?,
        last_error: row.try_get("last_error").map_err(storage_err)?,
    })
}
