//! PharmApp offline sync.
//!
//! A durable queue of state-changing HTTP actions captured while the
//! storefront was offline, and the engine that replays them once the server
//! is reachable again.

pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod queue;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::SyncConfig;
pub use connectivity::Connectivity;
pub use error::{QueueError, ReplayError};
pub use queue::{ActionQueue, DrainReport, QueueEntry, SubmitOutcome};
pub use sync::{SyncEvent, SyncState};

/// Initialize structured logging (console + daily rolling file).
///
/// `RUST_LOG` wins over `default_filter`. Keep the returned guard alive for
/// the life of the process; dropping it flushes the file writer.
pub fn init_logging(config: &SyncConfig) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    std::fs::create_dir_all(&config.log_dir)?;
    diagnostics::prune_old_logs(&config.log_dir, diagnostics::MAX_LOG_FILES);

    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Token source selected by configuration.
pub fn token_source(config: &SyncConfig) -> Arc<dyn storage::TokenSource> {
    match &config.csrf_source {
        config::CsrfSource::Keyring => Arc::new(storage::KeyringToken::new(config.keyring_key())),
        config::CsrfSource::Cookie(cookies) => {
            let jar = storage::CookieJarToken::new(storage::CSRF_COOKIE_NAME);
            jar.set_cookies(cookies);
            Arc::new(jar)
        }
        config::CsrfSource::Static(token) => Arc::new(storage::StaticToken(token.clone())),
        config::CsrfSource::None => Arc::new(storage::NoToken),
    }
}

/// Open the database and build a queue wired to the HTTP transport.
pub fn open_queue(config: &SyncConfig) -> anyhow::Result<ActionQueue> {
    let db = Arc::new(db::init(&config.data_dir)?);
    let transport = api::HttpTransport::new(
        config.attempt_timeout,
        token_source(config),
        &config.csrf_header,
    )
    .map_err(anyhow::Error::msg)?;
    Ok(ActionQueue::new(db, Arc::new(transport), config.queue_policy()))
}

/// Run the sync engine until Ctrl+C.
pub async fn run(config: SyncConfig) -> anyhow::Result<()> {
    info!(
        "Starting PharmApp sync v{} against {}",
        env!("CARGO_PKG_VERSION"),
        config.base_url
    );

    let state = Arc::new(SyncState::new());
    let queue = Arc::new(open_queue(&config)?.with_wake(state.wake_handle()));

    let connectivity = Arc::new(Connectivity::new(false));
    let probe = connectivity::start_connectivity_probe(
        connectivity.clone(),
        config.probe_url(),
        config.sync_interval,
    );

    // Wait for the first probe so a server that is already up drains on startup.
    let mut online_rx = connectivity.subscribe();
    let _ = tokio::time::timeout(api::DEFAULT_TIMEOUT, online_rx.changed()).await;

    let mut events = state.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SyncEvent::EntryAbandoned { entry } = &event {
                tracing::warn!(
                    id = entry.id,
                    url = %entry.endpoint.url,
                    reason = entry.reason.as_str(),
                    "Action will not be delivered; see dead letters"
                );
            }
        }
    });

    let sync_loop = sync::start_sync_loop(
        queue.clone(),
        state.clone(),
        connectivity.clone(),
        config.sync_interval,
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; finishing current drain");
    state.stop();
    sync_loop.await?;
    probe.abort();
    reporter.abort();
    Ok(())
}
