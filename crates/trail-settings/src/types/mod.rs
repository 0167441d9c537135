//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

mod api;
mod filter;
mod pipeline;

pub use api::*;
pub use filter::*;
pub use pipeline::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "api": { "publishableKey": "pk_live_..." },
///   "transmission": { "batchSize": 100 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrailSettings {
    pub api: ApiSettings,
    pub device: DeviceSettings,
    pub transmission: TransmissionSettings,
    pub scheduler: SchedulerSettings,
    pub filter: FilterSettings,
    pub collection: CollectionSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl TrailSettings {
    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transmission;
        let checks = [
            (t.batch_size == 0, "transmission.batchSize", "must be at least 1"),
            (
                t.max_retries > 0 && t.retry_backoff_secs.is_empty(),
                "transmission.retryBackoffSecs",
                "needs at least one delay while retries are enabled",
            ),
            (self.scheduler.tick_ms == 0, "scheduler.tickMs", "must be at least 1"),
            (self.api.timeout_ms == 0, "api.timeoutMs", "must be at least 1"),
        ];
        match checks.into_iter().find(|(failed, ..)| *failed) {
            Some((_, field, reason)) => Err(SettingsError::Invalid { field, reason }),
            None => Ok(()),
        }
    }
}

/// Storage location of the event database.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Path to the SQLite file. A leading `~/` expands to `$HOME`.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "~/.trail/database/trail.db".to_string(),
        }
    }
}

impl StorageSettings {
    pub fn resolved_database_path(&self) -> PathBuf {
        expand_home(&self.database_path)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(raw),
    }
}
