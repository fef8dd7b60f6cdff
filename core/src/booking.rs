//! Booking domain model: holds, bookings, and the outcomes of the
//! hold → confirm → status state machine.
//!
//! A [`Hold`] is a short-lived exclusive claim on a table/slot pending
//! confirmation. Confirming a hold consumes it (the row is deleted) and
//! creates a [`Booking`]. Bookings advance `BOOKED → {SEATED, NO_SHOW,
//! CANCELLED}` and never regress; cancelled rows are retained for audit.
//!
//! Every operation returns an explicit outcome value. Duplicate requests,
//! expired holds, and idempotent replays are ordinary results; only
//! unmodeled storage faults surface as errors, and those are fatal.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Monetary amount in minor units (cents). Stored as BIGINT so amounts
/// round-trip exactly.
pub type MinorUnits = i64;

/// Status of a confirmed booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BookingStatus {
    /// Confirmed, guest not yet arrived
    Booked,
    /// Guest arrived and was seated
    Seated,
    /// Guest never arrived
    NoShow,
    /// Cancelled; retained for audit
    Cancelled,
}

impl BookingStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Booked => "BOOKED",
            Self::Seated => "SEATED",
            Self::NoShow => "NO_SHOW",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse a status from its database string.
    ///
    /// # Errors
    ///
    /// Returns the unrecognized input when it matches no known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "BOOKED" => Ok(Self::Booked),
            "SEATED" => Ok(Self::Seated),
            "NO_SHOW" => Ok(Self::NoShow),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(other.to_string()),
        }
    }

    /// Whether this status occupies the table/slot.
    ///
    /// Active bookings are what the duplicate-slot checks and the partial
    /// unique index count; `NO_SHOW` and `CANCELLED` free the slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Booked | Self::Seated)
    }
}

/// A time-boxed exclusive claim on one table for one slot.
///
/// At most one unexpired hold exists per `(table_id, slot_start, slot_end)`;
/// the storage layer enforces this with a unique index. Holds are destroyed
/// by `confirm` (consumed) or by the periodic expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    /// Hold identifier
    pub id: Uuid,
    /// Tenant (venue) the table belongs to
    pub club_id: i64,
    /// Table being held
    pub table_id: i64,
    /// Event the slot belongs to
    pub event_id: i64,
    /// Slot start
    pub slot_start: DateTime<Utc>,
    /// Slot end
    pub slot_end: DateTime<Utc>,
    /// Number of guests
    pub guests: i32,
    /// Minimum deposit for the table, in minor units
    pub min_deposit: MinorUnits,
    /// Client-supplied idempotency token (unique)
    pub idempotency_key: String,
    /// When the hold stops being active
    pub expires_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Hold {
    /// Whether the hold is still active at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Whether this hold was created for the given request.
    ///
    /// Used to distinguish an idempotent replay (same key, same request)
    /// from a key reuse with a different body.
    #[must_use]
    pub fn matches(&self, req: &HoldRequest) -> bool {
        self.club_id == req.club_id
            && self.table_id == req.table_id
            && self.slot_start == req.slot_start
            && self.slot_end == req.slot_end
            && self.guests == req.guests
    }
}

/// Parameters for placing a hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    /// Tenant (venue)
    pub club_id: i64,
    /// Table to hold
    pub table_id: i64,
    /// Event the slot belongs to
    pub event_id: i64,
    /// Slot start
    pub slot_start: DateTime<Utc>,
    /// Slot end
    pub slot_end: DateTime<Utc>,
    /// Number of guests
    pub guests: i32,
    /// Minimum deposit for the table, in minor units
    pub min_deposit: MinorUnits,
    /// How long the hold stays active
    pub ttl: Duration,
}

/// A confirmed reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    /// Booking identifier
    pub id: Uuid,
    /// Tenant (venue)
    pub club_id: i64,
    /// Reserved table
    pub table_id: i64,
    /// Event the slot belongs to
    pub event_id: i64,
    /// Slot start
    pub slot_start: DateTime<Utc>,
    /// Slot end
    pub slot_end: DateTime<Utc>,
    /// Number of guests
    pub guests: i32,
    /// Total deposit, in minor units
    pub total_deposit: MinorUnits,
    /// Client-supplied idempotency token (unique)
    pub idempotency_key: String,
    /// Current lifecycle status
    pub status: BookingStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

/// Outcome of `hold` and `confirm`.
///
/// Every branch a caller must message differently is its own variant; none
/// of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingCmdResult {
    /// Hold placed (or idempotently replayed); carries the hold id
    HoldCreated(Uuid),
    /// Booking created; carries the booking id
    Booked(Uuid),
    /// Idempotent replay of a confirm; carries the original booking id
    AlreadyBooked(Uuid),
    /// The hold existed but its TTL had passed
    HoldExpired,
    /// An active booking already occupies the table/slot
    DuplicateActiveBooking,
    /// Idempotency key reused with a different request, or optimistic
    /// retries were exhausted
    IdempotencyConflict,
    /// The referenced hold or booking does not exist
    NotFound,
}

/// Outcome of the `seat` / `mark_no_show` status transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdateResult {
    /// Transition applied; carries the updated record
    Success(Booking),
    /// The booking is not in a state this transition applies to;
    /// carries the record as observed
    Conflict(Booking),
    /// No such booking for this tenant
    NotFound,
}

/// Outcome of `cancel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationResult {
    /// Booking cancelled; carries the updated record
    Cancelled(Booking),
    /// The booking was already cancelled
    AlreadyCancelled(Booking),
    /// The booking is in a state that cannot be cancelled
    ConflictingStatus(Booking),
    /// No such booking for this tenant
    NotFound,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            BookingStatus::Booked,
            BookingStatus::Seated,
            BookingStatus::NoShow,
            BookingStatus::Cancelled,
        ] {
            assert_eq!(BookingStatus::parse(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert!(BookingStatus::parse("PENDING").is_err());
    }

    #[test]
    fn only_booked_and_seated_are_active() {
        assert!(BookingStatus::Booked.is_active());
        assert!(BookingStatus::Seated.is_active());
        assert!(!BookingStatus::NoShow.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    fn sample_request() -> HoldRequest {
        HoldRequest {
            club_id: 1,
            table_id: 7,
            event_id: 42,
            slot_start: "2026-03-01T22:00:00Z".parse().unwrap(),
            slot_end: "2026-03-02T04:00:00Z".parse().unwrap(),
            guests: 4,
            min_deposit: 50_000,
            ttl: Duration::minutes(15),
        }
    }

    #[test]
    fn hold_matches_identical_request_only() {
        let req = sample_request();
        let hold = Hold {
            id: Uuid::new_v4(),
            club_id: req.club_id,
            table_id: req.table_id,
            event_id: req.event_id,
            slot_start: req.slot_start,
            slot_end: req.slot_end,
            guests: req.guests,
            min_deposit: req.min_deposit,
            idempotency_key: "key-1".into(),
            expires_at: req.slot_start,
            created_at: req.slot_start,
        };
        assert!(hold.matches(&req));

        let mut other = req;
        other.guests = 6;
        assert!(!hold.matches(&other));
    }
}
