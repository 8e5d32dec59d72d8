//! Online/offline signal.
//!
//! The host feeds `set_online` (OS reachability callbacks, UI hints) and/or
//! runs `start_connectivity_probe`. The sync loop subscribes and drains when
//! the value flips from offline to online.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api;

#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx }
    }

    /// Publish the current state. Repeating the same value does not wake
    /// subscribers.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network offline; queued actions stay pending");
            }
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Probe `probe_url` every `every` and publish the result. Runs until the
/// returned task is aborted.
pub fn start_connectivity_probe(
    connectivity: Arc<Connectivity>,
    probe_url: String,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match Client::builder().build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build probe client; connectivity probe disabled");
                return;
            }
        };
        info!(url = %probe_url, every_secs = every.as_secs(), "Connectivity probe started");

        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let online = api::check_network_status(&client, &probe_url).await;
            debug!(online, "Connectivity probe result");
            connectivity.set_online(online);
        }
    })
}
