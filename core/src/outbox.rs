//! Transactional outbox: message model and store port.
//!
//! An [`OutboxMessage`] is created in the same storage transaction as the
//! domain write it describes, so it exists if and only if that write
//! committed. The delivery worker drains due messages through the
//! [`OutboxStore`] port and marks each one sent, scheduled for retry, or
//! permanently failed.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Status of an outbox message.
///
/// `New` rows are deliverable once `next_attempt_at` is due. `Sent` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Awaiting (re)delivery
    New,
    /// Delivered at least once
    Sent,
    /// Given up permanently
    Failed,
}

impl OutboxStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] when the string matches no status.
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "NEW" => Ok(Self::New),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            other => Err(OutboxError::Storage(format!(
                "invalid outbox status: {other}"
            ))),
        }
    }
}

/// A durable unit of at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Monotonically increasing identifier; delivery order follows it
    pub id: i64,
    /// Routing topic (e.g. `booking.confirmed`)
    pub topic: String,
    /// Opaque structured payload
    pub payload: Value,
    /// Lifecycle status
    pub status: OutboxStatus,
    /// Number of delivery attempts made so far; only ever increases
    pub attempts: i32,
    /// Earliest instant the next attempt may run
    pub next_attempt_at: DateTime<Utc>,
    /// Diagnostic from the most recent failed attempt
    pub last_error: Option<String>,
}

/// Errors from outbox store operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// No message with the given id.
    #[error("outbox message not found: {0}")]
    NotFound(i64),
    /// Underlying storage failure.
    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Store port for the delivery worker.
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` to enable trait object usage and in-memory test doubles.
///
/// Enqueueing is deliberately NOT part of this port: inserts must happen on
/// the caller's live transaction handle (co-commit with the domain write),
/// so the postgres implementation exposes `enqueue(conn, ..)` separately.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due messages, oldest id first.
    ///
    /// A claimed message must not be claimable by a concurrent worker until
    /// it is marked terminal, rescheduled, or its claim lease expires.
    fn pick_batch(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>>;

    /// Like [`Self::pick_batch`], restricted to the given topics.
    fn pick_batch_for_topics<'a>(
        &'a self,
        topics: &'a [String],
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + 'a>>;

    /// Mark a message delivered. Idempotent: a call on a message that is
    /// already terminal (sent or failed) is a no-op, so a stale worker can
    /// never rewrite a terminal status.
    fn mark_sent(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Record a failed attempt and schedule the next one.
    fn mark_failed_with_retry<'a>(
        &'a self,
        id: i64,
        error: &'a str,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>>;

    /// Record a permanent failure. Terminal; a call on an already-terminal
    /// message is a no-op.
    fn mark_failed_permanently<'a>(
        &'a self,
        id: i64,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>>;
}

impl<T: OutboxStore + ?Sized> OutboxStore for Arc<T> {
    fn pick_batch(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>> {
        (**self).pick_batch(limit)
    }

    fn pick_batch_for_topics<'a>(
        &'a self,
        topics: &'a [String],
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + 'a>> {
        (**self).pick_batch_for_topics(topics, limit)
    }

    fn mark_sent(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        (**self).mark_sent(id)
    }

    fn mark_failed_with_retry<'a>(
        &'a self,
        id: i64,
        error: &'a str,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        (**self).mark_failed_with_retry(id, error, next_attempt_at)
    }

    fn mark_failed_permanently<'a>(
        &'a self,
        id: i64,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        (**self).mark_failed_permanently(id, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_status_roundtrip() {
        for status in [OutboxStatus::New, OutboxStatus::Sent, OutboxStatus::Failed] {
            let parsed = OutboxStatus::parse(status.as_str());
            assert!(matches!(parsed, Ok(s) if s == status));
        }
    }

    #[test]
    fn outbox_status_rejects_unknown() {
        assert!(OutboxStatus::parse("PENDING").is_err());
    }
}
