//! Background workers for Tablehold.
//!
//! - [`outbox_worker`]: drains the transactional outbox and hands messages
//!   to a [`tablehold_core::DeliveryPort`], owning retry scheduling.
//! - [`delivery`]: the HTTP delivery adapter.
//! - [`sweeper`]: periodic removal of expired holds.
//!
//! The `tablehold-worker` binary wires these together; see `main.rs`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Outbox delivery worker
pub mod outbox_worker;

/// HTTP delivery adapter
pub mod delivery;

/// Hold expiry sweeper
pub mod sweeper;

pub use delivery::HttpDeliveryPort;
pub use outbox_worker::{OutboxWorker, OutboxWorkerConfig};
pub use sweeper::{HoldSweeper, SweeperConfig};
