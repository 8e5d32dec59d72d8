//! Error taxonomy for the offline action queue.
//!
//! `QueueError` covers failures of the queue itself (the durable store, bad
//! input). `ReplayError` describes why a single replay attempt did not land;
//! it is recorded per entry and never aborts a drain.

use serde::Serialize;
use thiserror::Error;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The durable store could not be opened, read or written (quota
    /// exceeded, read-only file, corruption). Never retried automatically.
    #[error("durable store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("queue entry {0} not found")]
    NotFound(i64),

    /// The entry is currently claimed by a replay and cannot be edited.
    #[error("queue entry {0} is being replayed")]
    EntryBusy(i64),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::InvalidPayload(err.to_string())
    }
}

/// Why a replay attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ReplayError {
    /// No response: offline, DNS failure, connection refused, timeout.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The server answered with a non-2xx status.
    #[error("server rejected the action (HTTP {status}): {detail}")]
    ApplicationRejection { status: u16, detail: String },

    /// Terminal: the retry ceiling was reached.
    #[error("gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl ReplayError {
    /// Whether another attempt could ever succeed.
    ///
    /// 4xx responses other than 429 are permanent; 5xx, 429 and transport
    /// failures are retried up to the ceiling.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplayError::TransportFailure(_) => true,
            ReplayError::ApplicationRejection { status, .. } => {
                !(400..500).contains(status) || *status == 429
            }
            ReplayError::MaxRetriesExceeded { .. } => false,
        }
    }
}
