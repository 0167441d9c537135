use serde::{Deserialize, Serialize};

/// Collector endpoint and credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Base URL of the collector, without a trailing slash.
    pub base_url: String,
    /// Publishable key used to obtain access tokens.
    pub publishable_key: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Reported as `source.sdk_version` on every upload.
    pub sdk_version: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.trail.dev".to_string(),
            publishable_key: String::new(),
            timeout_ms: 10_000,
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Device metadata sent with the registration PATCH.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettings {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
    pub location_permission: String,
    pub motion_permission: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            model: "generic".to_string(),
            app_version: None,
            push_token: None,
            location_permission: "granted".to_string(),
            motion_permission: "granted".to_string(),
        }
    }
}
