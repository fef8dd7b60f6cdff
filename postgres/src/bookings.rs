//! Booking repository: row-level operations on `bookings`.
//!
//! Status transitions use conditional updates guarded by the expected
//! current status, so a lost race shows up as zero rows affected rather
//! than a silent overwrite. The partial unique index `bookings_active_slot`
//! is the sole mutual-exclusion mechanism for a table/slot.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use tablehold_core::{Booking, BookingStatus};

const BOOKING_COLUMNS: &str = "id, club_id, table_id, event_id, slot_start, slot_end, \
     guests, total_deposit, idempotency_key, status, created_at, updated_at";

/// Insert a booking.
///
/// # Errors
///
/// Any `sqlx` error, including unique violations from the idempotency key
/// or the active-slot index.
pub async fn insert(conn: &mut PgConnection, booking: &Booking) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO bookings (
            id, club_id, table_id, event_id, slot_start, slot_end,
            guests, total_deposit, idempotency_key, status, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ",
    )
    .bind(booking.id)
    .bind(booking.club_id)
    .bind(booking.table_id)
    .bind(booking.event_id)
    .bind(booking.slot_start)
    .bind(booking.slot_end)
    .bind(booking.guests)
    .bind(booking.total_deposit)
    .bind(&booking.idempotency_key)
    .bind(booking.status.as_str())
    .bind(booking.created_at)
    .bind(booking.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Look up a booking by id within a tenant.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn find_by_id(
    conn: &mut PgConnection,
    club_id: i64,
    id: Uuid,
) -> Result<Option<Booking>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings WHERE club_id = $1 AND id = $2"
    ))
    .bind(club_id)
    .bind(id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_booking).transpose()
}

/// Look up a booking by its idempotency key.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn find_by_idempotency_key(
    conn: &mut PgConnection,
    club_id: i64,
    key: &str,
) -> Result<Option<Booking>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings WHERE club_id = $1 AND idempotency_key = $2"
    ))
    .bind(club_id)
    .bind(key)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_booking).transpose()
}

/// Look up the active (BOOKED or SEATED) booking occupying a table/slot.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn find_active_by_slot(
    conn: &mut PgConnection,
    table_id: i64,
    slot_start: DateTime<Utc>,
    slot_end: DateTime<Utc>,
) -> Result<Option<Booking>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings \
         WHERE table_id = $1 AND slot_start = $2 AND slot_end = $3 \
           AND status IN ('BOOKED', 'SEATED')"
    ))
    .bind(table_id)
    .bind(slot_start)
    .bind(slot_end)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_booking).transpose()
}

/// Transition a booking's status, guarded by the expected current statuses.
///
/// Returns the updated record, or `None` when the booking does not exist
/// or its current status is not in `expected` (the caller re-reads to find
/// out which).
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn update_status(
    conn: &mut PgConnection,
    club_id: i64,
    id: Uuid,
    expected: &[BookingStatus],
    to: BookingStatus,
    now: DateTime<Utc>,
) -> Result<Option<Booking>, sqlx::Error> {
    let expected: Vec<&str> = expected.iter().map(BookingStatus::as_str).collect();
    let row = sqlx::query(&format!(
        "UPDATE bookings SET status = $1, updated_at = $2 \
         WHERE club_id = $3 AND id = $4 AND status = ANY($5) \
         RETURNING {BOOKING_COLUMNS}"
    ))
    .bind(to.as_str())
    .bind(now)
    .bind(club_id)
    .bind(id)
    .bind(&expected)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_booking).transpose()
}

fn row_to_booking(row: &sqlx::postgres::PgRow) -> Result<Booking, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = BookingStatus::parse(&status_str).map_err(|bad| sqlx::Error::ColumnDecode {
        index: "status".into(),
        source: format!("invalid booking status: {bad}").into(),
    })?;

    Ok(Booking {
        id: row.try_get("id")?,
        club_id: row.try_get("club_id")?,
        table_id: row.try_get("table_id")?,
        event_id: row.try_get("event_id")?,
        slot_start: row.try_get("slot_start")?,
        slot_end: row.try_get("slot_end")?,
        guests: row.try_get("guests")?,
        total_deposit: row.try_get("total_deposit")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
