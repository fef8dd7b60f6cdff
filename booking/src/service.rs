//! The hold → confirm → status state machine.
//!
//! Every operation runs through [`TxExecutor`], so transient storage
//! failures are retried and connection outages fail fast behind the
//! circuit breaker. Domain events are enqueued to the outbox on the same
//! connection as the domain write; they exist if and only if the write
//! committed.
//!
//! Unique indexes, not pre-checks, are the mutual-exclusion mechanism: the
//! service reads first only to produce precise outcomes, and maps the
//! constraint violations that concurrent writers still produce back into
//! outcome values by constraint name.

use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use tablehold_core::{
    Booking, BookingCmdResult, BookingStatus, CancellationResult, Clock, Hold, HoldRequest,
    StatusUpdateResult,
};
use tablehold_postgres::{
    TxError, TxExecutor, bookings, classify, holds, is_unique_violation, outbox,
    unique_constraint_name,
};

const TOPIC_CONFIRMED: &str = "booking.confirmed";
const TOPIC_SEATED: &str = "booking.seated";
const TOPIC_NO_SHOW: &str = "booking.no_show";
const TOPIC_CANCELLED: &str = "booking.cancelled";

const CONSTRAINT_HOLD_KEY: &str = "booking_holds_idempotency_key";
const CONSTRAINT_HOLD_SLOT: &str = "booking_holds_slot";
const CONSTRAINT_BOOKING_KEY: &str = "bookings_idempotency_key";
const CONSTRAINT_BOOKING_SLOT: &str = "bookings_active_slot";

/// Booking state machine over the transaction executor.
#[derive(Clone)]
pub struct BookingService {
    executor: TxExecutor,
    clock: Arc<dyn Clock>,
}

impl BookingService {
    /// Create a service.
    #[must_use]
    pub fn new(executor: TxExecutor, clock: Arc<dyn Clock>) -> Self {
        Self { executor, clock }
    }

    /// Place a hold on a table/slot.
    ///
    /// Replaying the same `idempotency_key` with the same request returns
    /// the existing hold; reusing the key with a different body is an
    /// [`BookingCmdResult::IdempotencyConflict`]. A slot occupied by an
    /// active hold or booking is a
    /// [`BookingCmdResult::DuplicateActiveBooking`].
    ///
    /// # Errors
    ///
    /// [`TxError::Unavailable`] while the circuit is open; unmapped storage
    /// errors propagate as [`TxError::Storage`].
    pub async fn hold(
        &self,
        idempotency_key: &str,
        req: &HoldRequest,
    ) -> Result<BookingCmdResult, TxError> {
        let clock = Arc::clone(&self.clock);
        let owned_key = idempotency_key.to_string();
        let owned_req = req.clone();

        let result = self
            .executor
            .run_tx("booking.hold", false, move |conn| {
                let clock = Arc::clone(&clock);
                let key = owned_key.clone();
                let req = owned_req.clone();
                Box::pin(async move {
                    let now = clock.now();

                    if let Some(existing) =
                        holds::find_by_idempotency_key(&mut *conn, req.club_id, &key).await?
                    {
                        if existing.is_active_at(now) {
                            return Ok(if existing.matches(&req) {
                                BookingCmdResult::HoldCreated(existing.id)
                            } else {
                                BookingCmdResult::IdempotencyConflict
                            });
                        }
                        // Expired hold under this key; replace it below.
                        holds::delete(&mut *conn, existing.id).await?;
                    }

                    if let Some(other) =
                        holds::find_by_slot(&mut *conn, req.table_id, req.slot_start, req.slot_end)
                            .await?
                    {
                        if other.is_active_at(now) {
                            return Ok(BookingCmdResult::DuplicateActiveBooking);
                        }
                        holds::delete(&mut *conn, other.id).await?;
                    }

                    if bookings::find_active_by_slot(
                        &mut *conn,
                        req.table_id,
                        req.slot_start,
                        req.slot_end,
                    )
                    .await?
                    .is_some()
                    {
                        return Ok(BookingCmdResult::DuplicateActiveBooking);
                    }

                    let hold = Hold {
                        id: Uuid::new_v4(),
                        club_id: req.club_id,
                        table_id: req.table_id,
                        event_id: req.event_id,
                        slot_start: req.slot_start,
                        slot_end: req.slot_end,
                        guests: req.guests,
                        min_deposit: req.min_deposit,
                        idempotency_key: key,
                        expires_at: now + req.ttl,
                        created_at: now,
                    };
                    holds::insert(&mut *conn, &hold).await?;
                    Ok(BookingCmdResult::HoldCreated(hold.id))
                })
            })
            .await;

        match result {
            Ok(outcome) => {
                tracing::info!(club_id = req.club_id, table_id = req.table_id, outcome = ?outcome, "hold processed");
                Ok(outcome)
            }
            Err(TxError::Storage(e)) if is_unique_violation(&e) => {
                Ok(match unique_constraint_name(&e) {
                    Some(CONSTRAINT_HOLD_KEY) => BookingCmdResult::IdempotencyConflict,
                    Some(CONSTRAINT_HOLD_SLOT | CONSTRAINT_BOOKING_SLOT) => {
                        BookingCmdResult::DuplicateActiveBooking
                    }
                    _ => return Err(TxError::Storage(e)),
                })
            }
            Err(TxError::Storage(e)) if classify(&e).retryable => {
                // Optimistic retries exhausted; the client must re-drive.
                Ok(BookingCmdResult::IdempotencyConflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Confirm a hold into a booking.
    ///
    /// Consumes the hold and creates the booking atomically, enqueuing a
    /// `booking.confirmed` event in the same transaction. Replays with the
    /// same `idempotency_key` return
    /// [`BookingCmdResult::AlreadyBooked`].
    ///
    /// # Errors
    ///
    /// [`TxError::Unavailable`] while the circuit is open; unmapped storage
    /// errors propagate as [`TxError::Storage`].
    pub async fn confirm(
        &self,
        club_id: i64,
        hold_id: Uuid,
        idempotency_key: &str,
    ) -> Result<BookingCmdResult, TxError> {
        let clock = Arc::clone(&self.clock);
        let key = idempotency_key.to_string();

        let result = self
            .executor
            .run_tx("booking.confirm", false, move |conn| {
                let clock = Arc::clone(&clock);
                let key = key.clone();
                Box::pin(async move {
                    let now = clock.now();

                    if let Some(existing) =
                        bookings::find_by_idempotency_key(&mut *conn, club_id, &key).await?
                    {
                        return Ok(BookingCmdResult::AlreadyBooked(existing.id));
                    }

                    let Some(hold) = holds::find_by_id(&mut *conn, club_id, hold_id).await? else {
                        return Ok(BookingCmdResult::NotFound);
                    };
                    if !hold.is_active_at(now) {
                        holds::delete(&mut *conn, hold.id).await?;
                        return Ok(BookingCmdResult::HoldExpired);
                    }

                    if bookings::find_active_by_slot(
                        &mut *conn,
                        hold.table_id,
                        hold.slot_start,
                        hold.slot_end,
                    )
                    .await?
                    .is_some()
                    {
                        return Ok(BookingCmdResult::DuplicateActiveBooking);
                    }

                    // Consume the hold. A concurrent confirm may have beaten
                    // us to the delete; the unique indexes below arbitrate.
                    holds::delete(&mut *conn, hold.id).await?;

                    let booking = Booking {
                        id: Uuid::new_v4(),
                        club_id: hold.club_id,
                        table_id: hold.table_id,
                        event_id: hold.event_id,
                        slot_start: hold.slot_start,
                        slot_end: hold.slot_end,
                        guests: hold.guests,
                        total_deposit: hold.min_deposit,
                        idempotency_key: key,
                        status: BookingStatus::Booked,
                        created_at: now,
                        updated_at: now,
                    };
                    bookings::insert(&mut *conn, &booking).await?;
                    outbox::enqueue(&mut *conn, now, TOPIC_CONFIRMED, &event_payload(&booking))
                        .await?;
                    Ok(BookingCmdResult::Booked(booking.id))
                })
            })
            .await;

        match result {
            Ok(outcome) => {
                tracing::info!(club_id, hold_id = %hold_id, outcome = ?outcome, "confirm processed");
                Ok(outcome)
            }
            Err(TxError::Storage(e)) if is_unique_violation(&e) => {
                match unique_constraint_name(&e) {
                    Some(CONSTRAINT_BOOKING_KEY) => {
                        // A concurrent replay won the insert; surface its id.
                        match self.find_by_idempotency_key(club_id, idempotency_key).await? {
                            Some(existing) => Ok(BookingCmdResult::AlreadyBooked(existing.id)),
                            None => Ok(BookingCmdResult::IdempotencyConflict),
                        }
                    }
                    Some(CONSTRAINT_BOOKING_SLOT) => Ok(BookingCmdResult::DuplicateActiveBooking),
                    _ => Err(TxError::Storage(e)),
                }
            }
            Err(TxError::Storage(e)) if classify(&e).retryable => {
                Ok(BookingCmdResult::IdempotencyConflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Mark a booked guest as seated.
    ///
    /// # Errors
    ///
    /// [`TxError::Unavailable`] while the circuit is open; unmapped storage
    /// errors propagate as [`TxError::Storage`].
    pub async fn seat(&self, club_id: i64, booking_id: Uuid) -> Result<StatusUpdateResult, TxError> {
        self.transition(club_id, booking_id, BookingStatus::Seated, TOPIC_SEATED)
            .await
    }

    /// Mark a booked guest as a no-show, freeing the slot.
    ///
    /// # Errors
    ///
    /// [`TxError::Unavailable`] while the circuit is open; unmapped storage
    /// errors propagate as [`TxError::Storage`].
    pub async fn mark_no_show(
        &self,
        club_id: i64,
        booking_id: Uuid,
    ) -> Result<StatusUpdateResult, TxError> {
        self.transition(club_id, booking_id, BookingStatus::NoShow, TOPIC_NO_SHOW)
            .await
    }

    /// Cancel a booking, freeing the slot. The row is retained for audit.
    ///
    /// Only `BOOKED` bookings can be cancelled; a seated or no-show booking
    /// is a [`CancellationResult::ConflictingStatus`].
    ///
    /// # Errors
    ///
    /// [`TxError::Unavailable`] while the circuit is open; unmapped storage
    /// errors propagate as [`TxError::Storage`].
    pub async fn cancel(
        &self,
        club_id: i64,
        booking_id: Uuid,
    ) -> Result<CancellationResult, TxError> {
        let clock = Arc::clone(&self.clock);

        let result = self
            .executor
            .run_tx("booking.cancel", false, move |conn| {
                let clock = Arc::clone(&clock);
                Box::pin(async move {
                    let now = clock.now();
                    let updated = bookings::update_status(
                        &mut *conn,
                        club_id,
                        booking_id,
                        &[BookingStatus::Booked],
                        BookingStatus::Cancelled,
                        now,
                    )
                    .await?;
                    if let Some(booking) = updated {
                        outbox::enqueue(
                            &mut *conn,
                            now,
                            TOPIC_CANCELLED,
                            &event_payload(&booking),
                        )
                        .await?;
                        return Ok(Some(booking));
                    }
                    Ok(None)
                })
            })
            .await;

        match result {
            Ok(Some(booking)) => {
                tracing::info!(club_id, booking_id = %booking_id, "booking cancelled");
                Ok(CancellationResult::Cancelled(booking))
            }
            Ok(None) => {
                // The guard rejected the update; re-read to say why.
                match self.find_by_id(club_id, booking_id).await? {
                    None => Ok(CancellationResult::NotFound),
                    Some(b) if b.status == BookingStatus::Cancelled => {
                        Ok(CancellationResult::AlreadyCancelled(b))
                    }
                    Some(b) => Ok(CancellationResult::ConflictingStatus(b)),
                }
            }
            Err(TxError::Storage(e)) if classify(&e).retryable => {
                match self.find_by_id(club_id, booking_id).await? {
                    None => Ok(CancellationResult::NotFound),
                    Some(b) if b.status == BookingStatus::Cancelled => {
                        Ok(CancellationResult::AlreadyCancelled(b))
                    }
                    Some(b) => Ok(CancellationResult::ConflictingStatus(b)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn transition(
        &self,
        club_id: i64,
        booking_id: Uuid,
        to: BookingStatus,
        topic: &'static str,
    ) -> Result<StatusUpdateResult, TxError> {
        let clock = Arc::clone(&self.clock);

        let result = self
            .executor
            .run_tx("booking.transition", false, move |conn| {
                let clock = Arc::clone(&clock);
                Box::pin(async move {
                    let now = clock.now();
                    let updated = bookings::update_status(
                        &mut *conn,
                        club_id,
                        booking_id,
                        &[BookingStatus::Booked],
                        to,
                        now,
                    )
                    .await?;
                    if let Some(booking) = updated {
                        outbox::enqueue(&mut *conn, now, topic, &event_payload(&booking)).await?;
                        return Ok(Some(booking));
                    }
                    Ok(None)
                })
            })
            .await;

        match result {
            Ok(Some(booking)) => {
                tracing::info!(club_id, booking_id = %booking_id, status = to.as_str(), "booking status updated");
                Ok(StatusUpdateResult::Success(booking))
            }
            // The guard rejected the update, or optimistic retries ran out;
            // re-read and let the caller see the state that won.
            Ok(None) => self.observe_transition_conflict(club_id, booking_id).await,
            Err(TxError::Storage(e)) if classify(&e).retryable => {
                self.observe_transition_conflict(club_id, booking_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn observe_transition_conflict(
        &self,
        club_id: i64,
        booking_id: Uuid,
    ) -> Result<StatusUpdateResult, TxError> {
        match self.find_by_id(club_id, booking_id).await? {
            Some(b) => Ok(StatusUpdateResult::Conflict(b)),
            None => Ok(StatusUpdateResult::NotFound),
        }
    }

    /// Fetch a booking, read-only.
    ///
    /// # Errors
    ///
    /// [`TxError::Unavailable`] while the circuit is open; storage errors
    /// propagate as [`TxError::Storage`].
    pub async fn find_by_id(
        &self,
        club_id: i64,
        booking_id: Uuid,
    ) -> Result<Option<Booking>, TxError> {
        self.executor
            .run_tx("booking.find_by_id", true, move |conn| {
                Box::pin(
                    async move { bookings::find_by_id(&mut *conn, club_id, booking_id).await },
                )
            })
            .await
    }

    async fn find_by_idempotency_key(
        &self,
        club_id: i64,
        key: &str,
    ) -> Result<Option<Booking>, TxError> {
        let key = key.to_string();
        self.executor
            .run_tx("booking.find_by_key", true, move |conn| {
                let key = key.clone();
                Box::pin(async move {
                    bookings::find_by_idempotency_key(&mut *conn, club_id, &key).await
                })
            })
            .await
    }
}

impl std::fmt::Debug for BookingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingService").finish_non_exhaustive()
    }
}
fn event_payload(booking: &Booking) -> Value {
    json!({
        "booking_id": booking.id,
        "club_id": booking.club_id,
        "table_id": booking.table_id,
        "event_id": booking.event_id,
        "slot_start": booking.slot_start,
        "slot_end": booking.slot_end,
        "guests": booking.guests,
        "total_deposit": booking.total_deposit,
        "status": booking.status.as_str(),
    })
}
