//! # Tablehold Core
//!
//! Domain types and ports for the Tablehold booking system.
//!
//! This crate is storage-agnostic. It defines:
//!
//! - The booking domain model: [`booking::Hold`], [`booking::Booking`],
//!   their status lifecycle, and the outcome enums every operation of the
//!   booking state machine returns.
//! - The transactional outbox contract: [`outbox::OutboxMessage`] and the
//!   [`outbox::OutboxStore`] port consumed by the delivery worker.
//! - The [`delivery::DeliveryPort`] through which outbox messages leave the
//!   system.
//! - An injectable [`clock::Clock`] so expiry, backoff, and lease arithmetic
//!   are deterministic under test.
//!
//! Expected domain outcomes (duplicate bookings, expired holds, idempotent
//! replays) are values, not errors: see [`booking::BookingCmdResult`].
//! Errors are reserved for faults the domain layer cannot model.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Booking domain model and operation outcomes
pub mod booking;

/// Injectable time source
pub mod clock;

/// Delivery port for outbox dispatch
pub mod delivery;

/// Transactional outbox message model and store port
pub mod outbox;

pub use booking::{
    Booking, BookingCmdResult, BookingStatus, CancellationResult, Hold, HoldRequest, MinorUnits,
    StatusUpdateResult,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{DeliveryOutcome, DeliveryPort};
pub use outbox::{OutboxError, OutboxMessage, OutboxStatus, OutboxStore};
