use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// Device metadata synced to the collector's registration endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub device_id: DeviceId,
    pub sdk_version: String,
    pub os_name: String,
    pub os_version: String,
    pub device_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
    #[serde(default)]
    pub location_permission: String,
    #[serde(default)]
    pub motion_permission: String,
}

impl DeviceRegistration {
    /// Stable JSON encoding used for change detection.
    pub fn canonical_json(&self) -> String {
        // Struct field order is fixed, so serde output is deterministic.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> DeviceRegistration {
        DeviceRegistration {
            device_id: DeviceId::from_raw("dev-1"),
            sdk_version: "1.0.0".into(),
            os_name: "linux".into(),
            os_version: "6.1".into(),
            device_model: "test".into(),
            app_version: None,
            push_token: None,
            location_permission: "granted".into(),
            motion_permission: "granted".into(),
        }
    }

    #[test]
    fn canonical_json_is_stable() {
        assert_eq!(registration().canonical_json(), registration().canonical_json());
    }

    #[test]
    fn canonical_json_changes_with_metadata() {
        let mut changed = registration();
        changed.push_token = Some("apns-token".into());
        assert_ne!(registration().canonical_json(), changed.canonical_json());
        assert!(!registration().canonical_json().contains("push_token"));
    }
}
