//! Local SQLite store backing the offline action queue.
//!
//! Uses rusqlite with WAL mode so a foreground process and a background
//! worker can share one database file. Provides schema migrations, settings
//! helpers and background-sync registrations.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::QueueError;

/// Shared handle to the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection. A poisoned lock means a previous holder panicked
    /// mid-statement; surface it as an unavailable store.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|e| QueueError::StorageUnavailable(format!("connection lock poisoned: {e}")))
    }
}

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "pharmapp-sync.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Current UTC time as RFC 3339 with millisecond precision.
///
/// Every timestamp the queue compares (created_at, lease_until) uses this
/// fixed-width format so lexical order matches chronological order.
pub fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Open (or create) the database at `{data_dir}/pharmapp-sync.db`.
///
/// Creates the directory if needed, sets pragmas and runs pending
/// migrations. Unlike a cache, a queue file that fails to open is never
/// deleted: the caller gets `StorageUnavailable` and must surface it.
pub fn init(data_dir: &Path) -> Result<DbState, QueueError> {
    fs::create_dir_all(data_dir).map_err(|e| {
        QueueError::StorageUnavailable(format!(
            "failed to create data dir {}: {e}",
            data_dir.display()
        ))
    })?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening queue database at {}", db_path.display());

    let mut conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), error = %e, "Queue database open failed");
        e
    })?;
    run_migrations(&mut conn)?;

    info!("Queue database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a private in-memory database with the full schema.
pub fn open_in_memory() -> Result<DbState, QueueError> {
    let mut conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&mut conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, QueueError> {
    let conn = Connection::open(path)
        .map_err(|e| QueueError::StorageUnavailable(format!("sqlite open: {e}")))?;

    // busy_timeout lets a second context wait out a short IMMEDIATE
    // transaction instead of failing with SQLITE_BUSY. It is set first
    // because switching to WAL takes a lock another context may hold.
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| QueueError::StorageUnavailable(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// The version check and every migration run in one IMMEDIATE transaction,
/// so two contexts opening a fresh file serialize here and the second one
/// sees the first one's schema.
fn run_migrations(conn: &mut Connection) -> Result<(), QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Queue schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating queue database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(&tx)?;
    }
    if current < 2 {
        migrate_v2(&tx)?;
    }

    tx.commit()?;
    Ok(())
}

/// Migration v1: queue, settings and background-sync registrations.
fn migrate_v1(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "
        -- sync_queue: one row per action awaiting replay
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- background_sync_registrations: one-shot wake-up requests by tag
        CREATE TABLE IF NOT EXISTS background_sync_registrations (
            tag TEXT PRIMARY KEY,
            registered_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_created_at ON sync_queue(created_at, id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        QueueError::StorageUnavailable(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (sync queue)");
    Ok(())
}

/// Check whether a column exists on a table.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, QueueError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: claim leases and the dead-letter table.
///
/// Adds:
/// - `claim_token` / `lease_until` so one replay owns an entry at a time
/// - `dead_letters` so abandoned entries are kept for inspection
fn migrate_v2(conn: &Connection) -> Result<(), QueueError> {
    if !column_exists(conn, "sync_queue", "claim_token")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN claim_token TEXT;")
            .map_err(|e| QueueError::StorageUnavailable(format!("migration v2 add claim_token: {e}")))?;
    }

    if !column_exists(conn, "sync_queue", "lease_until")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN lease_until TEXT;")
            .map_err(|e| QueueError::StorageUnavailable(format!("migration v2 add lease_until: {e}")))?;
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id INTEGER NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            reason TEXT NOT NULL CHECK (reason IN ('max_retries_exceeded', 'rejected')),
            last_error TEXT,
            created_at TEXT NOT NULL,
            abandoned_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status_lease
            ON sync_queue(status, lease_until);
        CREATE INDEX IF NOT EXISTS idx_dead_letters_abandoned_at
            ON dead_letters(abandoned_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        QueueError::StorageUnavailable(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (claim leases + dead letters)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a setting value by category and key.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), QueueError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Background sync registrations
// ---------------------------------------------------------------------------

/// Record interest in a one-shot background sync. Registering a tag that is
/// already pending is a no-op, so repeated enqueues collapse to one wake-up.
pub fn register_background_sync(conn: &Connection, tag: &str) -> Result<(), QueueError> {
    conn.execute(
        "INSERT OR IGNORE INTO background_sync_registrations (tag, registered_at)
         VALUES (?1, ?2)",
        params![tag, now_rfc3339()],
    )?;
    Ok(())
}

/// Consume a registration. Returns `true` if the tag was pending.
pub fn take_background_sync(conn: &Connection, tag: &str) -> Result<bool, QueueError> {
    let removed = conn.execute(
        "DELETE FROM background_sync_registrations WHERE tag = ?1",
        params![tag],
    )?;
    Ok(removed > 0)
}

/// Whether a registration is pending for `tag`.
pub fn has_background_sync(conn: &Connection, tag: &str) -> Result<bool, QueueError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM background_sync_registrations WHERE tag = ?1",
        params![tag],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let db = open_in_memory().expect("open in-memory db");
        let conn = db.conn.lock().unwrap();

        let tables = table_names(&conn);
        for expected in [
            "sync_queue",
            "local_settings",
            "background_sync_registrations",
            "dead_letters",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing {expected}"
            );
        }

        assert!(column_exists(&conn, "sync_queue", "claim_token").unwrap());
        assert!(column_exists(&conn, "sync_queue", "lease_until").unwrap());

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = open_in_memory().expect("open in-memory db");
        let mut conn = db.conn.lock().unwrap();
        run_migrations(&mut conn).expect("second run");

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = init(dir.path()).expect("init file db");
        let conn = db.conn.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
        assert_eq!(db.db_path, dir.path().join(DB_FILE_NAME));
    }

    #[test]
    fn test_concurrent_init_on_fresh_file_migrates_once() {
        for _ in 0..20 {
            let dir = tempfile::tempdir().expect("tempdir");
            let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let path = dir.path().to_path_buf();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        init(&path).map(|_| ())
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().expect("concurrent init");
            }

            let db = init(dir.path()).unwrap();
            let conn = db.conn.lock().unwrap();
            let rows: i64 = conn
                .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
                .unwrap();
            assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
        }
    }

    #[test]
    fn test_init_fails_when_data_dir_is_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let result = init(&blocker);
        assert!(matches!(result, Err(QueueError::StorageUnavailable(_))));
    }

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let db = open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();

        assert_eq!(get_setting(&conn, "sync", "last_sync_at"), None);
        set_setting(&conn, "sync", "last_sync_at", "a").unwrap();
        set_setting(&conn, "sync", "last_sync_at", "b").unwrap();
        assert_eq!(
            get_setting(&conn, "sync", "last_sync_at").as_deref(),
            Some("b")
        );
    }

    #[test]
    fn test_background_sync_registration_is_one_shot() {
        let db = open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();

        register_background_sync(&conn, "sync-pending-actions").unwrap();
        register_background_sync(&conn, "sync-pending-actions").unwrap();
        assert!(has_background_sync(&conn, "sync-pending-actions").unwrap());

        assert!(take_background_sync(&conn, "sync-pending-actions").unwrap());
        assert!(!take_background_sync(&conn, "sync-pending-actions").unwrap());
        assert!(!has_background_sync(&conn, "sync-pending-actions").unwrap());
    }
}
