//! Background sync engine.
//!
//! Decides *when* the action queue is drained. Triggers:
//! - startup, if the network is already up
//! - connectivity restored (offline -> online transition)
//! - the periodic timer (30-60 s)
//! - a background-sync registration left by `enqueue`
//! - `force_sync` from the host
//!
//! Overlapping triggers within one process collapse into the drain that is
//! already running. Results are published on a broadcast channel.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::db;
use crate::error::QueueError;
use crate::queue::{AbandonedEntry, ActionQueue, DrainReport, BACKGROUND_SYNC_TAG};

pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(60);

const SETTINGS_CATEGORY: &str = "sync";
const LAST_SYNC_KEY: &str = "last_sync_at";
/// Set while a drain runs so other processes can report it; expires on its
/// own if the draining process dies.
const DRAIN_RUNNING_KEY: &str = "drain_running_until";
const EVENT_CAPACITY: usize = 64;

/// Keep the periodic timer inside the supported window.
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_SYNC_INTERVAL, MAX_SYNC_INTERVAL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Startup,
    ConnectivityRestored,
    Periodic,
    BackgroundSync,
    Manual,
}

/// Broadcast to anyone watching the queue (UI, CLI, tests).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    DrainCompleted {
        trigger: TriggerReason,
        report: DrainReport,
    },
    EntryAbandoned {
        entry: AbandonedEntry,
    },
    NetworkStatus {
        online: bool,
    },
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub sync_running: bool,
    pub last_sync: Option<String>,
    pub pending_items: usize,
    pub dead_letters: usize,
}

// ---------------------------------------------------------------------------
// Sync engine state
// ---------------------------------------------------------------------------

/// Shared state for the background sync engine.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    drain_lock: AsyncMutex<()>,
    events: broadcast::Sender<SyncEvent>,
    wake: Arc<Notify>,
    stop: Notify,
}

impl SyncState {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            drain_lock: AsyncMutex::new(()),
            events,
            wake: Arc::new(Notify::new()),
            stop: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Handle to pass to `ActionQueue::with_wake`.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Ask the loop to exit once the current drain, if any, has finished.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.stop.notify_one();
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Last successful drain time, persisted across restarts.
pub fn last_sync(queue: &ActionQueue) -> Result<Option<String>, QueueError> {
    let conn = queue.db().lock()?;
    Ok(db::get_setting(&conn, SETTINGS_CATEGORY, LAST_SYNC_KEY))
}

pub fn get_sync_status(
    queue: &ActionQueue,
    state: &SyncState,
    connectivity: &Connectivity,
) -> Result<SyncStatus, QueueError> {
    let local_drain = state.drain_lock.try_lock().is_err();
    Ok(SyncStatus {
        is_online: connectivity.is_online(),
        sync_running: local_drain || drain_running_elsewhere(queue)?,
        last_sync: last_sync(queue)?,
        pending_items: queue.pending_count()?,
        dead_letters: queue.dead_letter_count()?,
    })
}

/// Whether any context sharing the database has a drain in progress.
fn drain_running_elsewhere(queue: &ActionQueue) -> Result<bool, QueueError> {
    let conn = queue.db().lock()?;
    Ok(db::get_setting(&conn, SETTINGS_CATEGORY, DRAIN_RUNNING_KEY)
        .is_some_and(|until| !until.is_empty() && until > db::now_rfc3339()))
}

/// Publish the drain heartbeat, sized to outlast one attempt per pending
/// entry plus a lease.
fn mark_drain_running(queue: &ActionQueue) -> Result<(), QueueError> {
    let pending = queue.pending_count()? as u32;
    let policy = queue.policy();
    let budget = policy.lease + policy.attempt_timeout.saturating_mul(pending);
    let until = chrono::Duration::from_std(budget)
        .map(|d| db::format_timestamp(chrono::Utc::now() + d))
        .unwrap_or_else(|_| db::now_rfc3339());
    let conn = queue.db().lock()?;
    db::set_setting(&conn, SETTINGS_CATEGORY, DRAIN_RUNNING_KEY, &until)
}

fn clear_drain_running(queue: &ActionQueue) -> Result<(), QueueError> {
    let conn = queue.db().lock()?;
    db::set_setting(&conn, SETTINGS_CATEGORY, DRAIN_RUNNING_KEY, "")
}

/// Drain once unless a drain is already running in this process, in which
/// case `Ok(None)` is returned and the running drain covers the trigger.
pub async fn run_drain(
    queue: &ActionQueue,
    state: &SyncState,
    trigger: TriggerReason,
) -> Result<Option<DrainReport>, QueueError> {
    let Ok(_guard) = state.drain_lock.try_lock() else {
        debug!(?trigger, "Drain already running; trigger coalesced");
        return Ok(None);
    };

    // Consume the registration up front: this drain covers every entry
    // enqueued so far.
    {
        let conn = queue.db().lock()?;
        db::take_background_sync(&conn, BACKGROUND_SYNC_TAG)?;
    }

    mark_drain_running(queue)?;
    let result = queue.drain().await;
    if let Err(e) = clear_drain_running(queue) {
        warn!(error = %e, "Failed to clear drain heartbeat; it will expire");
    }
    let report = result?;

    {
        let conn = queue.db().lock()?;
        db::set_setting(&conn, SETTINGS_CATEGORY, LAST_SYNC_KEY, &db::now_rfc3339())?;
    }

    if report.attempted() > 0 {
        info!(
            ?trigger,
            synced = report.synced,
            failed = report.failed,
            abandoned = report.abandoned,
            "Sync pass complete"
        );
    }
    for entry in &report.abandoned_entries {
        state.emit(SyncEvent::EntryAbandoned {
            entry: entry.clone(),
        });
    }
    state.emit(SyncEvent::DrainCompleted {
        trigger,
        report: report.clone(),
    });
    Ok(Some(report))
}

/// Trigger an immediate drain, regardless of the connectivity signal.
pub async fn force_sync(
    queue: &ActionQueue,
    state: &SyncState,
) -> Result<Option<DrainReport>, QueueError> {
    let report = run_drain(queue, state, TriggerReason::Manual).await?;
    if let Some(report) = &report {
        info!(synced = report.synced, "Force sync complete");
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background sync loop. Runs until `SyncState::stop`.
pub fn start_sync_loop(
    queue: Arc<ActionQueue>,
    state: Arc<SyncState>,
    connectivity: Arc<Connectivity>,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = clamp_interval(interval);
    state.is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Sync loop started");
        let mut online_rx = connectivity.subscribe();

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut next = connectivity.is_online().then_some(TriggerReason::Startup);

        loop {
            if !state.is_running.load(Ordering::SeqCst) {
                break;
            }

            if let Some(trigger) = next.take() {
                if connectivity.is_online() {
                    if let Err(e) = run_drain(&queue, &state, trigger).await {
                        warn!(?trigger, error = %e, "Sync pass failed");
                    }
                } else {
                    debug!(?trigger, "Offline; deferring drain");
                }
                continue;
            }

            next = tokio::select! {
                _ = state.stop.notified() => break,
                _ = ticker.tick() => Some(TriggerReason::Periodic),
                _ = state.wake.notified() => Some(TriggerReason::BackgroundSync),
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    state.emit(SyncEvent::NetworkStatus { online });
                    online.then_some(TriggerReason::ConnectivityRestored)
                }
            };
        }

        state.is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}
