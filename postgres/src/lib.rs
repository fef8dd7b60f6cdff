//! `PostgreSQL` storage layer for Tablehold.
//!
//! This crate wires the resilience policies from `tablehold-runtime` to
//! real transactions via sqlx:
//!
//! - Error classification by SQLSTATE ([`classify`])
//! - A retrying transaction executor under circuit-breaker protection
//!   ([`executor::TxExecutor`])
//! - Hold and booking repositories ([`holds`], [`bookings`])
//! - The transactional outbox ([`outbox`])
//!
//! # Example
//!
//! ```ignore
//! use tablehold_postgres::{MIGRATOR, TxExecutor};
//!
//! async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     MIGRATOR.run(&pool).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// SQLSTATE-based error classification
pub mod classify;

/// Retrying transaction executor
pub mod executor;

/// Hold repository
pub mod holds;

/// Booking repository
pub mod bookings;

/// Transactional outbox store
pub mod outbox;

pub use classify::{
    DbErrorClassification, DbErrorReason, classify, is_unique_violation, unique_constraint_name,
};
pub use executor::{TxError, TxExecutor, TxFuture};
pub use outbox::PgOutboxStore;

/// Embedded schema migrations (`./migrations`).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();
