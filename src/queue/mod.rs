//! Durable action queue.
//!
//! Actions that could not be confirmed as delivered are persisted here and
//! replayed by `drain()` until the server accepts them or the retry ceiling
//! is reached. One `ActionQueue` is built per execution context and passed
//! to whoever needs it; several contexts may share the same database file.
//!
//! Per entry:
//!
//! ```text
//! pending --claim--> in_flight --2xx--> deleted
//!                        |--failure, retries left--> pending (retry_count + 1)
//!                        |--failure at ceiling / permanent 4xx--> dead letter
//!                        `--lease expired--> claimable again
//! ```

mod dead_letter;
mod store;

pub use dead_letter::{AbandonReason, DeadLetter};

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{self, ReplayRequest, ReplayTransport};
use crate::db::{self, DbState};
use crate::error::{QueueError, ReplayError};

/// Tag of the one-shot background wake-up requested on every enqueue.
pub const BACKGROUND_SYNC_TAG: &str = "sync-pending-actions";

/// Default retry ceiling.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Methods a queued action may use.
const ALLOWED_METHODS: &[&str] = &["POST", "PUT", "PATCH", "DELETE"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where an action is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEndpoint {
    pub method: String,
    /// Absolute URL, or a path resolved against the configured base URL.
    pub url: String,
}

impl ActionEndpoint {
    /// Validate and normalise an endpoint. Methods are upper-cased and must
    /// be a state-changing verb; the URL must be non-empty and contain no
    /// whitespace.
    pub fn new(method: &str, url: &str) -> Result<Self, QueueError> {
        let method = method.trim().to_uppercase();
        if method.parse::<Method>().is_err() || !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(QueueError::InvalidEndpoint(format!(
                "unsupported HTTP method: {method:?}"
            )));
        }

        let url = url.trim();
        if url.is_empty() || url.chars().any(char::is_whitespace) {
            return Err(QueueError::InvalidEndpoint(format!("invalid URL: {url:?}")));
        }

        Ok(Self {
            method,
            url: url.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    /// Claimed by a drain; `lease_until` bounds the claim.
    InFlight,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InFlight => "in_flight",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "in_flight" => EntryStatus::InFlight,
            _ => EntryStatus::Pending,
        }
    }
}

/// A persisted action awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub endpoint: ActionEndpoint,
    pub payload: Value,
    /// Sent with every replay of this entry so the server can deduplicate.
    pub idempotency_key: String,
    pub created_at: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: EntryStatus,
    pub last_error: Option<String>,
    pub lease_until: Option<String>,
}

/// Caller edit to a pending entry. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    pub endpoint: Option<ActionEndpoint>,
    pub payload: Option<Value>,
}

/// An entry the queue gave up on during a drain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonedEntry {
    pub id: i64,
    pub endpoint: ActionEndpoint,
    pub reason: AbandonReason,
    pub error: ReplayError,
}

/// Outcome counts of one `drain()` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Delivered and deleted.
    pub synced: usize,
    /// Failed and left pending for a later drain.
    pub failed: usize,
    /// Moved to the dead-letter table.
    pub abandoned: usize,
    /// Held by another context's lease, or gone before it could be claimed.
    pub skipped: usize,
    pub abandoned_entries: Vec<AbandonedEntry>,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.synced + self.failed + self.abandoned
    }

    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Synced => self.synced += 1,
            Settlement::Retrying => self.failed += 1,
            Settlement::Abandoned(entry) => {
                self.abandoned += 1;
                self.abandoned_entries.push(entry);
            }
            Settlement::LostClaim => self.skipped += 1,
        }
    }
}

/// Result of `submit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// The server accepted the action on the first try.
    Delivered,
    /// The attempt failed transiently; the action is queued under `id`.
    Queued { id: i64, error: ReplayError },
    /// The server refused the action permanently. Nothing was queued.
    Rejected { error: ReplayError },
}

enum Settlement {
    Synced,
    Retrying,
    Abandoned(AbandonedEntry),
    /// Our lease expired and another context took the entry over.
    LostClaim,
}

/// Replay policy for one queue instance.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Base URL that relative action paths are resolved against.
    pub base_url: String,
    /// Ceiling copied onto each new entry.
    pub max_retries: u32,
    /// Upper bound on one replay attempt.
    pub attempt_timeout: Duration,
    /// How long a claim stays exclusive. Must exceed `attempt_timeout`.
    pub lease: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            attempt_timeout: api::DEFAULT_TIMEOUT,
            lease: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue service
// ---------------------------------------------------------------------------

pub struct ActionQueue {
    db: Arc<DbState>,
    transport: Arc<dyn ReplayTransport>,
    policy: QueuePolicy,
    wake: Option<Arc<Notify>>,
}

impl ActionQueue {
    pub fn new(
        db: Arc<DbState>,
        transport: Arc<dyn ReplayTransport>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            db,
            transport,
            policy,
            wake: None,
        }
    }

    /// Notify `wake` after every enqueue so a running sync loop can pick up
    /// the background-sync registration without waiting for its timer.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Persist an action for later replay and return its id.
    ///
    /// Once this returns `Ok` the entry survives restarts until it is
    /// delivered, abandoned or removed. A store that cannot be written
    /// yields `StorageUnavailable`; the caller must tell the user.
    pub fn enqueue(&self, endpoint: &str, method: &str, payload: Value) -> Result<i64, QueueError> {
        let entry = self.new_entry(endpoint, method, &payload)?;
        self.persist(&entry)
    }

    /// Send an action now, falling back to the queue.
    ///
    /// One attempt is made under the same timeout and classification as a
    /// replay. Transport failures and retryable rejections queue the action
    /// with the idempotency key already sent, so a request that landed
    /// without its answer is deduplicated on replay. A permanent rejection
    /// is returned without queueing.
    pub async fn submit(
        &self,
        endpoint: &str,
        method: &str,
        payload: Value,
    ) -> Result<SubmitOutcome, QueueError> {
        let entry = self.new_entry(endpoint, method, &payload)?;

        let result = self
            .attempt(&entry.endpoint, &entry.payload_json, &entry.idempotency_key)
            .await;
        match result {
            Ok(()) => {
                debug!(
                    method = %entry.endpoint.method,
                    url = %entry.endpoint.url,
                    "Action delivered online"
                );
                Ok(SubmitOutcome::Delivered)
            }
            Err(error) if !error.is_retryable() => {
                warn!(
                    method = %entry.endpoint.method,
                    url = %entry.endpoint.url,
                    error = %error,
                    "Action rejected by server; not queued"
                );
                Ok(SubmitOutcome::Rejected { error })
            }
            Err(error) => {
                info!(
                    url = %entry.endpoint.url,
                    error = %error,
                    "Online attempt failed; queueing action"
                );
                let id = self.persist(&entry)?;
                Ok(SubmitOutcome::Queued { id, error })
            }
        }
    }

    fn new_entry(
        &self,
        endpoint: &str,
        method: &str,
        payload: &Value,
    ) -> Result<store::NewEntry, QueueError> {
        let endpoint = ActionEndpoint::new(method, endpoint)?;
        if !payload.is_object() {
            return Err(QueueError::InvalidPayload(
                "payload must be a JSON object".into(),
            ));
        }

        Ok(store::NewEntry {
            endpoint,
            payload_json: serde_json::to_string(payload)?,
            idempotency_key: Uuid::new_v4().to_string(),
            max_retries: self.policy.max_retries,
            created_at: db::now_rfc3339(),
        })
    }

    fn persist(&self, entry: &store::NewEntry) -> Result<i64, QueueError> {
        let id = {
            let mut conn = self.db.lock()?;
            store::insert_entry(&mut conn, entry, BACKGROUND_SYNC_TAG).map_err(|e| {
                warn!(
                    method = %entry.endpoint.method,
                    url = %entry.endpoint.url,
                    error = %e,
                    "Failed to persist offline action"
                );
                e
            })?
        };

        info!(
            id,
            method = %entry.endpoint.method,
            url = %entry.endpoint.url,
            "Queued offline action"
        );

        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
        Ok(id)
    }

    /// Replay every claimable entry once, oldest first.
    ///
    /// A failed replay never stops the batch; a store failure does and is
    /// returned. Draining an empty queue returns a zero report.
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let ids = {
            let conn = self.db.lock()?;
            store::claimable_ids(&conn, &db::now_rfc3339())?
        };

        let mut report = DrainReport::default();
        if ids.is_empty() {
            debug!("Drain: no pending actions");
            return Ok(report);
        }
        debug!(count = ids.len(), "Draining offline action queue");

        for id in ids {
            let token = Uuid::new_v4().to_string();
            let claimed = {
                let mut conn = self.db.lock()?;
                let (now, lease_until) = self.lease_window();
                store::claim(&mut conn, id, &token, &now, &lease_until)?
            };
            let Some(entry) = claimed else {
                debug!(id, "Entry claimed elsewhere or already gone; skipping");
                report.skipped += 1;
                continue;
            };

            let result = self.replay(&entry).await;
            let settlement = self.settle(&entry, &token, result)?;
            report.record(settlement);
        }

        info!(
            synced = report.synced,
            failed = report.failed,
            abandoned = report.abandoned,
            skipped = report.skipped,
            "Drain complete"
        );
        Ok(report)
    }

    fn lease_window(&self) -> (String, String) {
        let now = Utc::now();
        let lease =
            ChronoDuration::from_std(self.policy.lease).unwrap_or_else(|_| ChronoDuration::seconds(60));
        (db::format_timestamp(now), db::format_timestamp(now + lease))
    }

    async fn replay(&self, entry: &QueueEntry) -> Result<(), ReplayError> {
        let body = entry.payload.to_string();
        self.attempt(&entry.endpoint, &body, &entry.idempotency_key)
            .await
    }

    /// One network attempt, bounded by the per-attempt timeout.
    async fn attempt(
        &self,
        endpoint: &ActionEndpoint,
        body: &str,
        idempotency_key: &str,
    ) -> Result<(), ReplayError> {
        let request = ReplayRequest {
            method: endpoint.method.clone(),
            url: api::resolve_url(&self.policy.base_url, &endpoint.url),
            body: body.to_string(),
            idempotency_key: idempotency_key.to_string(),
        };

        let response =
            match tokio::time::timeout(self.policy.attempt_timeout, self.transport.send(&request))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ReplayError::TransportFailure(format!(
                        "No response from {} within {}ms",
                        request.url,
                        self.policy.attempt_timeout.as_millis()
                    )))
                }
            };

        if response.is_success() {
            Ok(())
        } else {
            Err(api::rejection_from_response(&response))
        }
    }

    /// Record the outcome of one attempt against the entry we claimed.
    fn settle(
        &self,
        entry: &QueueEntry,
        token: &str,
        result: Result<(), ReplayError>,
    ) -> Result<Settlement, QueueError> {
        let mut conn = self.db.lock()?;

        let error = match result {
            Ok(()) => {
                if !store::complete(&conn, entry.id, token)? {
                    warn!(id = entry.id, "Lease lost before delete; entry left to its new owner");
                    return Ok(Settlement::LostClaim);
                }
                info!(
                    id = entry.id,
                    method = %entry.endpoint.method,
                    url = %entry.endpoint.url,
                    attempt = entry.retry_count + 1,
                    "Synced offline action"
                );
                return Ok(Settlement::Synced);
            }
            Err(error) => error,
        };

        let attempts = entry.retry_count + 1;
        let message = error.to_string();

        let terminal = if !error.is_retryable() {
            Some((AbandonReason::Rejected, error))
        } else if attempts >= entry.max_retries {
            Some((
                AbandonReason::MaxRetriesExceeded,
                ReplayError::MaxRetriesExceeded {
                    attempts,
                    last_error: message.clone(),
                },
            ))
        } else {
            None
        };

        match terminal {
            Some((reason, final_error)) => {
                if !dead_letter::abandon(&mut conn, entry.id, token, attempts, reason, &message)? {
                    warn!(id = entry.id, "Lease lost before abandon; entry left to its new owner");
                    return Ok(Settlement::LostClaim);
                }
                warn!(
                    id = entry.id,
                    method = %entry.endpoint.method,
                    url = %entry.endpoint.url,
                    attempts,
                    reason = reason.as_str(),
                    error = %message,
                    "Abandoned offline action; moved to dead letters"
                );
                Ok(Settlement::Abandoned(AbandonedEntry {
                    id: entry.id,
                    endpoint: entry.endpoint.clone(),
                    reason,
                    error: final_error,
                }))
            }
            None => {
                if !store::record_failure(&conn, entry.id, token, attempts, &message)? {
                    warn!(id = entry.id, "Lease lost before retry update; entry left to its new owner");
                    return Ok(Settlement::LostClaim);
                }
                warn!(
                    id = entry.id,
                    url = %entry.endpoint.url,
                    retry_count = attempts,
                    max_retries = entry.max_retries,
                    error = %message,
                    "Offline action replay failed; will retry"
                );
                Ok(Settlement::Retrying)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inspection and maintenance
    // -----------------------------------------------------------------------

    pub fn get(&self, id: i64) -> Result<Option<QueueEntry>, QueueError> {
        let conn = self.db.lock()?;
        store::get_entry(&conn, id)
    }

    /// Every entry still in the queue, oldest first.
    pub fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let conn = self.db.lock()?;
        store::list_entries(&conn)
    }

    pub fn pending_count(&self) -> Result<usize, QueueError> {
        let conn = self.db.lock()?;
        store::count_entries(&conn)
    }

    /// Edit an entry that is not being replayed right now.
    pub fn update(&self, id: i64, update: EntryUpdate) -> Result<QueueEntry, QueueError> {
        let payload_json = match &update.payload {
            Some(p) if !p.is_object() => {
                return Err(QueueError::InvalidPayload(
                    "payload must be a JSON object".into(),
                ))
            }
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };
        let mut conn = self.db.lock()?;
        let entry = store::update_entry(&mut conn, id, &update, payload_json.as_deref())?;
        debug!(id, "Updated queued action");
        Ok(entry)
    }

    /// Drop an entry without replaying it.
    pub fn remove(&self, id: i64) -> Result<(), QueueError> {
        let mut conn = self.db.lock()?;
        store::delete_entry(&mut conn, id)?;
        info!(id, "Removed queued action");
        Ok(())
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let conn = self.db.lock()?;
        dead_letter::list(&conn)
    }

    pub fn dead_letter_count(&self) -> Result<usize, QueueError> {
        let conn = self.db.lock()?;
        dead_letter::count(&conn)
    }

    /// Give a dead letter another full set of attempts. Returns the new
    /// queue entry id.
    pub fn requeue_dead_letter(&self, id: i64) -> Result<i64, QueueError> {
        let entry_id = {
            let mut conn = self.db.lock()?;
            dead_letter::requeue(&mut conn, id, self.policy.max_retries, BACKGROUND_SYNC_TAG)?
        };
        info!(dead_letter_id = id, entry_id, "Requeued dead letter");
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
        Ok(entry_id)
    }

    pub fn purge_dead_letters(&self) -> Result<usize, QueueError> {
        let conn = self.db.lock()?;
        let removed = dead_letter::purge(&conn)?;
        info!(removed, "Purged dead letters");
        Ok(removed)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
