use std::fmt::Write as _;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use trail_core::platform::DeviceInfo;
use trail_core::registration::DeviceRegistration;
use trail_core::PipelineError;
use trail_net::{ApiClient, Endpoint};
use trail_store::{kv, KvRepo};

/// Keeps the collector's copy of the device metadata current.
///
/// The last successfully registered payload is remembered as a SHA-256
/// digest of its canonical JSON; a PATCH is sent only when it changes.
pub struct RegistrationSync {
    device: Arc<dyn DeviceInfo>,
    client: Arc<ApiClient>,
    kv: KvRepo,
}

impl RegistrationSync {
    pub fn new(device: Arc<dyn DeviceInfo>, client: Arc<ApiClient>, kv: KvRepo) -> Self {
        Self { device, client, kv }
    }

    pub fn digest(registration: &DeviceRegistration) -> String {
        let hash = Sha256::digest(registration.canonical_json().as_bytes());
        hash.iter().fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }

    /// Returns `true` when a PATCH was sent.
    pub async fn ensure_registered(&self) -> Result<bool, PipelineError> {
        let registration = self.device.registration();
        let digest = Self::digest(&registration);

        let stored: Option<String> = self.kv.get(kv::REGISTRATION_DIGEST).unwrap_or_else(|e| {
            warn!(error = %e, "stored registration digest unreadable, re-registering");
            None
        });
        if stored.as_deref() == Some(digest.as_str()) {
            debug!("registration unchanged");
            return Ok(false);
        }

        let body = serde_json::to_value(&registration)
            .map_err(|e| PipelineError::PayloadMappingFailed(e.to_string()))?;
        self.client
            .call(&Endpoint::Device(registration.device_id.clone()), Some(body))
            .await?;

        self.kv
            .set(kv::REGISTRATION_DIGEST, &digest)
            .map_err(|e| PipelineError::DatabaseWriteFailed(e.to_string()))?;
        info!(device_id = %registration.device_id, "device registration updated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::broadcast;
    use trail_core::auth::PublishableKey;
    use trail_core::platform::{ManualClock, StaticDeviceInfo};
    use trail_core::DeviceId;
    use trail_net::{AuthController, MockReply, MockTransport, RetryPolicy};
    use trail_store::Database;

    fn registration() -> DeviceRegistration {
        DeviceRegistration {
            device_id: DeviceId::from_raw("dev-1"),
            sdk_version: "0.1.0".into(),
            os_name: "linux".into(),
            os_version: "6.1".into(),
            device_model: "test".into(),
            app_version: None,
            push_token: None,
            location_permission: "granted".into(),
            motion_permission: "granted".into(),
        }
    }

    fn sync(mock: MockTransport) -> (Arc<MockTransport>, StaticDeviceInfo, RegistrationSync) {
        let db = Database::in_memory().unwrap();
        let mock = Arc::new(mock);
        let (tx, _) = broadcast::channel(8);
        let auth = AuthController::new(
            mock.clone(),
            KvRepo::new(db.clone()),
            Arc::new(ManualClock::new(Utc::now())),
            DeviceId::from_raw("dev-1"),
            PublishableKey::new("pk"),
            tx,
        );
        let client = Arc::new(ApiClient::new(mock.clone(), Arc::new(auth), RetryPolicy::none()));
        let info = StaticDeviceInfo::new(registration());
        let sync = RegistrationSync::new(Arc::new(info.clone()), client, KvRepo::new(db));
        (mock, info, sync)
    }

    fn device_endpoint() -> Endpoint {
        Endpoint::Device(DeviceId::from_raw("dev-1"))
    }

    #[test]
    fn digest_is_hex_sha256() {
        let d = RegistrationSync::digest(&registration());
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn patches_only_on_change() {
        let (mock, info, sync) = sync(
            MockTransport::new()
                .with_token()
                .on(&device_endpoint(), vec![MockReply::ok()]),
        );

        assert!(sync.ensure_registered().await.unwrap());
        assert!(!sync.ensure_registered().await.unwrap());
        assert_eq!(mock.count_to(&device_endpoint()), 1);

        info.update(|r| r.push_token = Some("apns".into()));
        assert!(sync.ensure_registered().await.unwrap());
        let sent = mock.requests_to(&device_endpoint().path());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].body.as_ref().unwrap()["push_token"], "apns");
    }

    #[tokio::test]
    async fn failed_patch_keeps_old_snapshot() {
        let (mock, _info, sync) = sync(
            MockTransport::new()
                .with_token()
                .on(&device_endpoint(), vec![MockReply::status(422), MockReply::ok()]),
        );
        assert!(sync.ensure_registered().await.is_err());
        assert!(sync.ensure_registered().await.unwrap());
        assert_eq!(mock.count_to(&device_endpoint()), 2);
    }
}
