//! # trail-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`TrailSettings::default()`])
//! 2. **User file**, `~/.trail/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**, `TRAIL_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = trail_settings::load_settings().unwrap_or_default();
//! println!("batch size: {}", settings.transmission.batch_size);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::*;
