//! SQL for the `sync_queue` table.
//!
//! Every read-modify-write that decides ownership of an entry runs inside an
//! IMMEDIATE transaction, so two processes sharing the file cannot both
//! claim the same row.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;

use super::{ActionEndpoint, EntryStatus, EntryUpdate, QueueEntry};
use crate::db;
use crate::error::QueueError;

const ENTRY_COLUMNS: &str = "id, method, url, payload, idempotency_key, status, retry_count,
     max_retries, last_error, created_at, lease_until";

/// Condition for a row that a drain may claim at `:now`.
const CLAIMABLE: &str = "(status = 'pending' OR (status = 'in_flight' AND lease_until < :now))";

/// A validated entry ready for insertion.
pub(crate) struct NewEntry {
    pub endpoint: ActionEndpoint,
    pub payload_json: String,
    pub idempotency_key: String,
    pub max_retries: u32,
    pub created_at: String,
}

pub(crate) fn parse_payload(idx: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let payload: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        endpoint: ActionEndpoint {
            method: row.get(1)?,
            url: row.get(2)?,
        },
        payload: parse_payload(3, &payload)?,
        idempotency_key: row.get(4)?,
        status: EntryStatus::from_db(&status),
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        lease_until: row.get(10)?,
    })
}

/// Insert an entry and, in the same transaction, record the background-sync
/// registration so the wake-up request is as durable as the entry itself.
pub(crate) fn insert_entry(
    conn: &mut Connection,
    entry: &NewEntry,
    sync_tag: &str,
) -> Result<i64, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO sync_queue (
             method, url, payload, idempotency_key, status,
             retry_count, max_retries, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6)",
        params![
            entry.endpoint.method,
            entry.endpoint.url,
            entry.payload_json,
            entry.idempotency_key,
            entry.max_retries,
            entry.created_at,
        ],
    )?;
    let id = tx.last_insert_rowid();
    db::register_background_sync(&tx, sync_tag)?;
    tx.commit()?;
    Ok(id)
}

/// Ids of entries a drain may attempt, oldest first.
pub(crate) fn claimable_ids(conn: &Connection, now: &str) -> Result<Vec<i64>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM sync_queue WHERE {CLAIMABLE} ORDER BY created_at ASC, id ASC"
    ))?;
    let ids = stmt
        .query_map(rusqlite::named_params! { ":now": now }, |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Claim an entry for one replay attempt. Returns `None` when the entry is
/// gone or another context holds a live lease on it.
pub(crate) fn claim(
    conn: &mut Connection,
    id: i64,
    token: &str,
    now: &str,
    lease_until: &str,
) -> Result<Option<QueueEntry>, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let updated = tx.execute(
        &format!(
            "UPDATE sync_queue
             SET status = 'in_flight', claim_token = :token, lease_until = :lease, updated_at = :now
             WHERE id = :id AND {CLAIMABLE}"
        ),
        rusqlite::named_params! {
            ":token": token,
            ":lease": lease_until,
            ":now": now,
            ":id": id,
        },
    )?;
    if updated == 0 {
        tx.commit()?;
        return Ok(None);
    }
    let entry = tx
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
            params![id],
            row_to_entry,
        )
        .optional()?;
    tx.commit()?;
    Ok(entry)
}

/// Delete an entry after a successful replay. `false` if the claim was lost.
pub(crate) fn complete(conn: &Connection, id: i64, token: &str) -> Result<bool, QueueError> {
    let deleted = conn.execute(
        "DELETE FROM sync_queue WHERE id = ?1 AND claim_token = ?2",
        params![id, token],
    )?;
    Ok(deleted > 0)
}

/// Return an entry to `pending` with its new retry count.
pub(crate) fn record_failure(
    conn: &Connection,
    id: i64,
    token: &str,
    retry_count: u32,
    error: &str,
) -> Result<bool, QueueError> {
    let updated = conn.execute(
        "UPDATE sync_queue
         SET status = 'pending',
             retry_count = ?1,
             last_error = ?2,
             claim_token = NULL,
             lease_until = NULL,
             updated_at = ?3
         WHERE id = ?4 AND claim_token = ?5",
        params![retry_count, error, db::now_rfc3339(), id, token],
    )?;
    Ok(updated > 0)
}

pub(crate) fn get_entry(conn: &Connection, id: i64) -> Result<Option<QueueEntry>, QueueError> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
            params![id],
            row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

pub(crate) fn list_entries(conn: &Connection) -> Result<Vec<QueueEntry>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM sync_queue ORDER BY created_at ASC, id ASC"
    ))?;
    let entries = stmt
        .query_map([], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Number of entries still waiting for delivery (pending or in flight).
pub(crate) fn count_entries(conn: &Connection) -> Result<usize, QueueError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Fails with `EntryBusy` when a live lease is held on the entry.
fn ensure_not_in_flight(tx: &Connection, id: i64, now: &str) -> Result<(), QueueError> {
    let row: Option<(String, Option<String>)> = tx
        .query_row(
            "SELECT status, lease_until FROM sync_queue WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        None => Err(QueueError::NotFound(id)),
        Some((status, lease_until)) => {
            let live_lease = lease_until.as_deref().is_some_and(|l| l >= now);
            if EntryStatus::from_db(&status) == EntryStatus::InFlight && live_lease {
                Err(QueueError::EntryBusy(id))
            } else {
                Ok(())
            }
        }
    }
}

/// Apply a caller edit to a pending entry. Retry count, idempotency key and
/// creation time are never touched.
pub(crate) fn update_entry(
    conn: &mut Connection,
    id: i64,
    update: &EntryUpdate,
    payload_json: Option<&str>,
) -> Result<QueueEntry, QueueError> {
    let now = db::now_rfc3339();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    ensure_not_in_flight(&tx, id, &now)?;

    if let Some(endpoint) = &update.endpoint {
        tx.execute(
            "UPDATE sync_queue SET method = ?1, url = ?2, updated_at = ?3 WHERE id = ?4",
            params![endpoint.method, endpoint.url, now, id],
        )?;
    }
    if let Some(payload) = payload_json {
        tx.execute(
            "UPDATE sync_queue SET payload = ?1, updated_at = ?2 WHERE id = ?3",
            params![payload, now, id],
        )?;
    }

    let entry = tx.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
        params![id],
        row_to_entry,
    )?;
    tx.commit()?;
    Ok(entry)
}

/// Remove an entry that is not currently being replayed.
pub(crate) fn delete_entry(conn: &mut Connection, id: i64) -> Result<(), QueueError> {
    let now = db::now_rfc3339();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    ensure_not_in_flight(&tx, id, &now)?;
    tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(())
}
