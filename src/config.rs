//! Runtime configuration from `PHARMAPP_SYNC_*` environment variables.
//!
//! `.env` is loaded by the binary before `SyncConfig::from_env` runs. Only
//! the server base URL is required.

use std::path::PathBuf;
use std::time::Duration;

use crate::api;
use crate::queue::{QueuePolicy, DEFAULT_MAX_RETRIES};
use crate::storage::CSRF_COOKIE_NAME;
use crate::sync;

/// Where the anti-forgery token comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrfSource {
    /// OS keyring entry named after the cookie.
    Keyring,
    /// Cookie header string, parsed for the token cookie.
    Cookie(String),
    Static(String),
    None,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_retries: u32,
    pub sync_interval: Duration,
    pub attempt_timeout: Duration,
    pub lease: Duration,
    pub csrf_header: String,
    pub csrf_source: CsrfSource,
    pub probe_path: String,
    pub log_level: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let base_url = lookup("PHARMAPP_SYNC_BASE_URL")
            .map(|u| api::normalize_base_url(&u))
            .filter(|u| !u.is_empty())
            .ok_or("Missing required environment variable: PHARMAPP_SYNC_BASE_URL")?;

        let data_dir = lookup("PHARMAPP_SYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let log_dir = lookup("PHARMAPP_SYNC_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        let max_retries: u32 = env_or("PHARMAPP_SYNC_MAX_RETRIES", &DEFAULT_MAX_RETRIES.to_string())
            .parse()
            .map_err(|e| format!("Invalid PHARMAPP_SYNC_MAX_RETRIES: {e}"))?;
        if max_retries == 0 {
            return Err("PHARMAPP_SYNC_MAX_RETRIES must be at least 1".into());
        }

        let interval_secs: u64 = env_or("PHARMAPP_SYNC_INTERVAL_SECS", "45")
            .parse()
            .map_err(|e| format!("Invalid PHARMAPP_SYNC_INTERVAL_SECS: {e}"))?;
        let timeout_secs: u64 = env_or(
            "PHARMAPP_SYNC_TIMEOUT_SECS",
            &api::DEFAULT_TIMEOUT.as_secs().to_string(),
        )
        .parse()
        .map_err(|e| format!("Invalid PHARMAPP_SYNC_TIMEOUT_SECS: {e}"))?;
        let lease_secs: u64 = env_or("PHARMAPP_SYNC_LEASE_SECS", "60")
            .parse()
            .map_err(|e| format!("Invalid PHARMAPP_SYNC_LEASE_SECS: {e}"))?;
        if timeout_secs == 0 {
            return Err("PHARMAPP_SYNC_TIMEOUT_SECS must be at least 1".into());
        }
        if lease_secs <= timeout_secs {
            return Err(format!(
                "PHARMAPP_SYNC_LEASE_SECS ({lease_secs}) must exceed PHARMAPP_SYNC_TIMEOUT_SECS ({timeout_secs})"
            ));
        }

        let csrf_source = match env_or("PHARMAPP_SYNC_CSRF_SOURCE", "keyring").as_str() {
            "keyring" => CsrfSource::Keyring,
            "cookie" => CsrfSource::Cookie(env_or("PHARMAPP_SYNC_COOKIES", "")),
            "static" => CsrfSource::Static(
                lookup("PHARMAPP_SYNC_CSRF_TOKEN")
                    .ok_or("PHARMAPP_SYNC_CSRF_SOURCE=static requires PHARMAPP_SYNC_CSRF_TOKEN")?,
            ),
            "none" => CsrfSource::None,
            other => return Err(format!("Invalid PHARMAPP_SYNC_CSRF_SOURCE: {other}")),
        };

        Ok(Self {
            base_url,
            data_dir,
            log_dir,
            max_retries,
            sync_interval: sync::clamp_interval(Duration::from_secs(interval_secs)),
            attempt_timeout: Duration::from_secs(timeout_secs),
            lease: Duration::from_secs(lease_secs),
            csrf_header: env_or("PHARMAPP_SYNC_CSRF_HEADER", "X-CSRFToken"),
            csrf_source,
            probe_path: env_or("PHARMAPP_SYNC_PROBE_PATH", "/"),
            log_level: env_or("PHARMAPP_SYNC_LOG_LEVEL", "info,pharmapp_sync=debug"),
        })
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            base_url: self.base_url.clone(),
            max_retries: self.max_retries,
            attempt_timeout: self.attempt_timeout,
            lease: self.lease,
        }
    }

    pub fn probe_url(&self) -> String {
        api::resolve_url(&self.base_url, &self.probe_path)
    }

    /// Keyring entry holding the token when `csrf_source` is `Keyring`.
    pub fn keyring_key(&self) -> &'static str {
        CSRF_COOKIE_NAME
    }
}

/// Per-user data directory, e.g. `~/.local/share/pharmapp-sync`.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("pharmapp-sync")
}
