//! Booking state machine for Tablehold.
//!
//! [`BookingService`] implements hold → confirm → status transitions on top
//! of the retrying transaction executor, with every domain event enqueued
//! to the outbox inside the transaction that produced it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// The booking service
pub mod service;

pub use service::BookingService;
