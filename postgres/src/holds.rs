//! Hold repository: row-level operations on `booking_holds`.
//!
//! Free functions over `&mut PgConnection` so every call runs on the
//! caller's transaction; composition into atomic units happens in the
//! booking service, not here.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use tablehold_core::Hold;

const HOLD_COLUMNS: &str = "id, club_id, table_id, event_id, slot_start, slot_end, \
     guests, min_deposit, idempotency_key, expires_at, created_at";

/// Insert a hold.
///
/// The unique constraints on `idempotency_key` and `(table_id, slot_start,
/// slot_end)` are the concurrency control; callers classify violations.
///
/// # Errors
///
/// Any `sqlx` error, including unique violations.
pub async fn insert(conn: &mut PgConnection, hold: &Hold) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO booking_holds (
            id, club_id, table_id, event_id, slot_start, slot_end,
            guests, min_deposit, idempotency_key, expires_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ",
    )
    .bind(hold.id)
    .bind(hold.club_id)
    .bind(hold.table_id)
    .bind(hold.event_id)
    .bind(hold.slot_start)
    .bind(hold.slot_end)
    .bind(hold.guests)
    .bind(hold.min_deposit)
    .bind(&hold.idempotency_key)
    .bind(hold.expires_at)
    .bind(hold.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Look up a hold by its idempotency key.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn find_by_idempotency_key(
    conn: &mut PgConnection,
    club_id: i64,
    key: &str,
) -> Result<Option<Hold>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {HOLD_COLUMNS} FROM booking_holds WHERE club_id = $1 AND idempotency_key = $2"
    ))
    .bind(club_id)
    .bind(key)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_hold).transpose()
}

/// Look up a hold by id.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn find_by_id(
    conn: &mut PgConnection,
    club_id: i64,
    id: Uuid,
) -> Result<Option<Hold>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {HOLD_COLUMNS} FROM booking_holds WHERE club_id = $1 AND id = $2"
    ))
    .bind(club_id)
    .bind(id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_hold).transpose()
}

/// Look up the hold occupying a table/slot, if any.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn find_by_slot(
    conn: &mut PgConnection,
    table_id: i64,
    slot_start: DateTime<Utc>,
    slot_end: DateTime<Utc>,
) -> Result<Option<Hold>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {HOLD_COLUMNS} FROM booking_holds \
         WHERE table_id = $1 AND slot_start = $2 AND slot_end = $3"
    ))
    .bind(table_id)
    .bind(slot_start)
    .bind(slot_end)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_hold).transpose()
}

/// Delete a hold, consuming it. Returns the number of rows removed (0 when
/// a concurrent transaction consumed it first).
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM booking_holds WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// Delete every hold that expired at or before `now`. Returns the count.
///
/// # Errors
///
/// Any `sqlx` error.
pub async fn delete_expired(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM booking_holds WHERE expires_at <= $1")
        .bind(now)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

fn row_to_hold(row: &sqlx::postgres::PgRow) -> Result<Hold, sqlx::Error> {
    Ok(Hold {
        id: row.try_get("id")?,
        club_id: row.try_get("club_id")?,
        table_id: row.try_get("table_id")?,
        event_id: row.try_get("event_id")?,
        slot_start: row.try_get("slot_start")?,
        slot_end: row.try_get("slot_end")?,
        guests: row.try_get("guests")?,
        min_deposit: row.try_get("min_deposit")?,
        idempotency_key: row.try_get("idempotency_key")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}
