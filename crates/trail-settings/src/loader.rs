//! Layered loading: compiled defaults, then the user's JSON file merged
//! key by key, then `TRAIL_*` variables.
//!
//! When merging, objects combine per key, while arrays and scalars from
//! the file replace the default outright. A `null` in the file leaves
//! the default in place.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{home_dir, TrailSettings};

/// `~/.trail/settings.json`
pub fn settings_path() -> PathBuf {
    home_dir().join(".trail").join("settings.json")
}

pub fn load_settings() -> Result<TrailSettings> {
    load_settings_from_path(&settings_path())
}

/// Loads `path` over the defaults and applies the process environment.
///
/// A missing file is not an error; unreadable JSON or values that fail
/// [`TrailSettings::validate`] are.
pub fn load_settings_from_path(path: &Path) -> Result<TrailSettings> {
    let mut layered = serde_json::to_value(TrailSettings::default())?;
    if let Some(user) = read_user_file(path)? {
        layered = deep_merge(layered, user);
    }

    let mut settings: TrailSettings = serde_json::from_value(layered)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_user_file(path: &Path) -> Result<Option<Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(None);
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    debug!(path = %path.display(), "settings file found");
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => Value::Object(merge_maps(base, overlay)),
        (_, overlay) => overlay,
    }
}

fn merge_maps(mut base: Map<String, Value>, overlay: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
        let combined = match base.remove(&key) {
            Some(existing) => deep_merge(existing, value),
            None => value,
        };
        base.insert(key, combined);
    }
    base
}

pub fn apply_env_overrides(settings: &mut TrailSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// One `TRAIL_*` variable and how it lands in the settings.
struct Override {
    var: &'static str,
    apply: fn(&mut TrailSettings, &str) -> bool,
}

/// Parses a number and stores it if it falls inside `range`.
fn ranged<T>(raw: &str, range: std::ops::RangeInclusive<T>, slot: &mut T) -> bool
where
    T: std::str::FromStr + PartialOrd,
{
    match raw.trim().parse::<T>() {
        Ok(n) if range.contains(&n) => {
            *slot = n;
            true
        }
        _ => false,
    }
}

const OVERRIDES: &[Override] = &[
    Override {
        var: "TRAIL_BASE_URL",
        apply: |s, v| {
            s.api.base_url = v.trim_end_matches('/').to_owned();
            true
        },
    },
    Override {
        var: "TRAIL_PUBLISHABLE_KEY",
        apply: |s, v| {
            s.api.publishable_key = v.to_owned();
            true
        },
    },
    Override {
        var: "TRAIL_TIMEOUT_MS",
        apply: |s, v| ranged(v, 100..=600_000, &mut s.api.timeout_ms),
    },
    Override {
        var: "TRAIL_BATCH_SIZE",
        apply: |s, v| ranged(v, 1..=1000, &mut s.transmission.batch_size),
    },
    Override {
        var: "TRAIL_MAX_RETRIES",
        apply: |s, v| ranged(v, 0..=10, &mut s.transmission.max_retries),
    },
    Override {
        var: "TRAIL_DEBOUNCE_MS",
        apply: |s, v| ranged(v, 0..=60_000, &mut s.scheduler.debounce_ms),
    },
    Override {
        var: "TRAIL_TICK_MS",
        apply: |s, v| ranged(v, 100..=3_600_000, &mut s.scheduler.tick_ms),
    },
    Override {
        var: "TRAIL_DATABASE_PATH",
        apply: |s, v| {
            s.storage.database_path = v.to_owned();
            true
        },
    },
    Override {
        var: "TRAIL_LOG_LEVEL",
        apply: |s, v| {
            s.logging.level = v.to_owned();
            true
        },
    },
    Override {
        var: "TRAIL_LOG_JSON",
        apply: |s, v| match parse_bool(v) {
            Some(b) => {
                s.logging.json = b;
                true
            }
            None => false,
        },
    },
];

/// Applies overrides read through `lookup`. Empty values are skipped and
/// unparseable ones are logged and ignored.
pub fn apply_overrides_from<F>(settings: &mut TrailSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for o in OVERRIDES {
        let Some(raw) = lookup(o.var).filter(|v| !v.is_empty()) else {
            continue;
        };
        if !(o.apply)(settings, &raw) {
            warn!(var = o.var, value = %raw, "ignoring unusable environment override");
        }
    }
}

/// `true`/`1`/`yes`/`on` and their negatives, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    let lowered = val.trim().to_ascii_lowercase();
    if ["true", "1", "yes", "on"].contains(&lowered.as_str()) {
        Some(true)
    } else if ["false", "0", "no", "off"].contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}
