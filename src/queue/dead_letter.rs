//! Dead letters: entries the queue gave up on.
//!
//! An abandoned entry is copied here and deleted from `sync_queue` in one
//! transaction, so the action is never in both tables and never in neither.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::parse_payload;
use super::ActionEndpoint;
use crate::db;
use crate::error::QueueError;

/// Why an entry was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// The retry ceiling was reached on retryable failures.
    MaxRetriesExceeded,
    /// The server refused the action with a non-retryable 4xx.
    Rejected,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::MaxRetriesExceeded => "max_retries_exceeded",
            AbandonReason::Rejected => "rejected",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "rejected" => AbandonReason::Rejected,
            _ => AbandonReason::MaxRetriesExceeded,
        }
    }
}

/// An abandoned action kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    /// Id the action had in the queue.
    pub entry_id: i64,
    pub endpoint: ActionEndpoint,
    pub payload: Value,
    pub idempotency_key: String,
    pub retry_count: u32,
    pub reason: AbandonReason,
    pub last_error: Option<String>,
    pub created_at: String,
    pub abandoned_at: String,
}

fn row_to_dead_letter(row: &Row<'_>) -> rusqlite::Result<DeadLetter> {
    let payload: String = row.get(4)?;
    let reason: String = row.get(7)?;
    Ok(DeadLetter {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        endpoint: ActionEndpoint {
            method: row.get(2)?,
            url: row.get(3)?,
        },
        payload: parse_payload(4, &payload)?,
        idempotency_key: row.get(5)?,
        retry_count: row.get(6)?,
        reason: AbandonReason::from_db(&reason),
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        abandoned_at: row.get(10)?,
    })
}

const DEAD_LETTER_COLUMNS: &str = "id, entry_id, method, url, payload, idempotency_key,
     retry_count, reason, last_error, created_at, abandoned_at";

/// Move a claimed entry to the dead-letter table. `false` if the claim was
/// lost (the entry is left untouched).
pub(crate) fn abandon(
    conn: &mut Connection,
    id: i64,
    token: &str,
    retry_count: u32,
    reason: AbandonReason,
    error: &str,
) -> Result<bool, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let copied = tx.execute(
        "INSERT INTO dead_letters (
             entry_id, method, url, payload, idempotency_key, retry_count,
             reason, last_error, created_at, abandoned_at
         )
         SELECT id, method, url, payload, idempotency_key, ?1, ?2, ?3, created_at, ?4
         FROM sync_queue
         WHERE id = ?5 AND claim_token = ?6",
        params![
            retry_count,
            reason.as_str(),
            error,
            db::now_rfc3339(),
            id,
            token
        ],
    )?;
    if copied == 0 {
        return Ok(false);
    }
    tx.execute(
        "DELETE FROM sync_queue WHERE id = ?1 AND claim_token = ?2",
        params![id, token],
    )?;
    tx.commit()?;
    Ok(true)
}

/// All dead letters, most recently abandoned first.
pub(crate) fn list(conn: &Connection) -> Result<Vec<DeadLetter>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters ORDER BY abandoned_at DESC, id DESC"
    ))?;
    let letters = stmt
        .query_map([], row_to_dead_letter)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(letters)
}

pub(crate) fn count(conn: &Connection) -> Result<usize, QueueError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Put a dead letter back on the queue as a fresh pending entry: retry count
/// 0, enqueued now, same idempotency key so the server can still deduplicate
/// it against any earlier delivery.
pub(crate) fn requeue(
    conn: &mut Connection,
    id: i64,
    max_retries: u32,
    sync_tag: &str,
) -> Result<i64, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let letter = tx
        .query_row(
            &format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?1"),
            params![id],
            row_to_dead_letter,
        )
        .optional()?
        .ok_or(QueueError::NotFound(id))?;

    let now = db::now_rfc3339();
    tx.execute(
        "INSERT INTO sync_queue (
             method, url, payload, idempotency_key, status,
             retry_count, max_retries, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6)",
        params![
            letter.endpoint.method,
            letter.endpoint.url,
            serde_json::to_string(&letter.payload)?,
            letter.idempotency_key,
            max_retries,
            now,
        ],
    )?;
    let entry_id = tx.last_insert_rowid();
    tx.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?;
    db::register_background_sync(&tx, sync_tag)?;
    tx.commit()?;
    Ok(entry_id)
}

/// Delete every dead letter. Returns how many were removed.
pub(crate) fn purge(conn: &Connection) -> Result<usize, QueueError> {
    Ok(conn.execute("DELETE FROM dead_letters", [])?)
}
