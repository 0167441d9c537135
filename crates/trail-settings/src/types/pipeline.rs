use serde::{Deserialize, Serialize};

/// Batch upload and request retry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransmissionSettings {
    /// Events read from a queue per upload.
    pub batch_size: usize,
    /// Retries after the first attempt, for 5xx responses only.
    pub max_retries: u32,
    /// Delay before each retry, indexed by attempt. The last entry repeats
    /// if `max_retries` exceeds the list.
    pub retry_backoff_secs: Vec<u64>,
}

impl Default for TransmissionSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 3,
            retry_backoff_secs: vec![4, 9, 16],
        }
    }
}

/// Dispatch timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Leading debounce window for dispatch triggers.
    pub debounce_ms: u64,
    /// Periodic flush interval.
    pub tick_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            tick_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionSettings {
    /// Collection pauses when the device has been offline this long.
    pub offline_limit_hours: i64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            offline_limit_hours: 12,
        }
    }
}
