use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, instrument, warn};

use trail_core::auth::{AuthStatus, AuthToken, InactiveReason, PublishableKey, TokenRecord};
use trail_core::platform::Clock;
use trail_core::signals::PipelineSignal;
use trail_core::transport::Transport;
use trail_core::{DeviceId, PipelineError};
use trail_store::{kv, EventQueue, KvRepo};

use crate::endpoint::Endpoint;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    expires_in: i64,
}

/// Owns the access token and the account status.
///
/// Token and status are persisted through [`KvRepo`] and restored on
/// construction, so an `inactive` account stays inactive across restarts
/// until a key change or an explicit successful [`reauthenticate`].
///
/// [`reauthenticate`]: AuthController::reauthenticate
pub struct AuthController {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    kv: KvRepo,
    device_id: DeviceId,
    key: RwLock<PublishableKey>,
    token: RwLock<Option<AuthToken>>,
    status: RwLock<AuthStatus>,
    queues: Vec<EventQueue>,
    signals: broadcast::Sender<PipelineSignal>,
    refresh: AsyncMutex<()>,
}

impl AuthController {
    pub fn new(
        transport: Arc<dyn Transport>,
        kv: KvRepo,
        clock: Arc<dyn Clock>,
        device_id: DeviceId,
        key: PublishableKey,
        signals: broadcast::Sender<PipelineSignal>,
    ) -> Self {
        let token = match kv.get::<TokenRecord>(kv::AUTH_TOKEN) {
            Ok(record) => record.map(AuthToken::from_record),
            Err(e) => {
                warn!(error = %e, "stored auth token unreadable, discarding");
                None
            }
        };
        let status = match kv.get::<AuthStatus>(kv::AUTH_STATUS) {
            Ok(status) => status.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "stored auth status unreadable, assuming active");
                AuthStatus::Active
            }
        };
        if status == AuthStatus::Inactive {
            warn!("restored inactive auth status");
        }

        Self {
            transport,
            policy: RetryPolicy::default(),
            clock,
            kv,
            device_id,
            key: RwLock::new(key),
            token: RwLock::new(token),
            status: RwLock::new(status),
            queues: Vec::new(),
            signals,
            refresh: AsyncMutex::new(()),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Queues purged when the account becomes inactive.
    pub fn with_purge(mut self, queues: Vec<EventQueue>) -> Self {
        self.queues = queues;
        self
    }

    pub fn status(&self) -> AuthStatus {
        *self.status.read()
    }

    pub fn is_active(&self) -> bool {
        self.status() == AuthStatus::Active
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn current_valid(&self) -> Option<AuthToken> {
        let now = self.clock.now();
        self.token
            .read()
            .as_ref()
            .filter(|t| !t.is_expired(now))
            .cloned()
    }

    /// A usable token, fetching a new one if none is cached or the cached one
    /// is inside the expiry buffer. Fails fast when the account is inactive.
    pub async fn token(&self) -> Result<AuthToken, PipelineError> {
        if !self.is_active() {
            return Err(PipelineError::AuthInactive);
        }
        if let Some(token) = self.current_valid() {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.current_valid() {
            return Ok(token);
        }
        self.fetch_token().await
    }

    /// Discard the current token and fetch a new one. Success also clears an
    /// inactive status.
    #[instrument(skip(self))]
    pub async fn reauthenticate(&self) -> Result<AuthToken, PipelineError> {
        let _guard = self.refresh.lock().await;
        *self.token.write() = None;
        let token = self.fetch_token().await?;
        self.set_status(AuthStatus::Active);
        Ok(token)
    }

    async fn fetch_token(&self) -> Result<AuthToken, PipelineError> {
        let body = {
            let key = self.key.read();
            serde_json::json!({
                "publishable_key": key.expose(),
                "device_id": self.device_id,
            })
        };
        let transport = &self.transport;
        let result = self
            .policy
            .run(|| {
                let request = Endpoint::Token.request().with_body(body.clone());
                async move { transport.send(request).await?.into_result() }
            })
            .await;

        match result {
            Ok(resp) => {
                let parsed: TokenResponse = serde_json::from_str(&resp.body).map_err(|e| {
                    PipelineError::Transport(format!("invalid token response: {e}"))
                })?;
                let token = AuthToken::new(parsed.token, parsed.expires_in, self.clock.now());
                if let Err(e) = self.kv.set(kv::AUTH_TOKEN, &token.to_record()) {
                    warn!(error = %e, "failed to persist auth token");
                }
                *self.token.write() = Some(token.clone());
                info!(expires_in = token.expires_in_seconds, "access token issued");
                Ok(token)
            }
            Err(PipelineError::AuthorizationFailed(_)) => {
                self.mark_inactive(InactiveReason::InvalidPublishableKey);
                Err(PipelineError::InvalidPublishableKey)
            }
            Err(PipelineError::Forbidden(body)) => {
                self.mark_inactive(InactiveReason::TrialEnded);
                Err(PipelineError::Forbidden(body))
            }
            Err(e) => {
                warn!(error = %e, "token request failed");
                Err(e)
            }
        }
    }

    /// Terminal transition: drop credentials, purge both queues, and notify
    /// subscribers. Repeated calls are no-ops.
    pub fn mark_inactive(&self, reason: InactiveReason) {
        {
            let mut status = self.status.write();
            if *status == AuthStatus::Inactive {
                return;
            }
            *status = AuthStatus::Inactive;
        }
        warn!(%reason, "auth inactive, stopping delivery");

        *self.token.write() = None;
        if let Err(e) = self.kv.set(kv::AUTH_STATUS, &AuthStatus::Inactive) {
            warn!(error = %e, "failed to persist auth status");
        }
        if let Err(e) = self.kv.remove(kv::AUTH_TOKEN) {
            warn!(error = %e, "failed to clear stored token");
        }
        for queue in &self.queues {
            match queue.delete_all() {
                Ok(removed) => debug!(category = %queue.category(), removed, "queue purged"),
                Err(e) => warn!(category = %queue.category(), error = %e, "queue purge failed"),
            }
        }
        let _ = self.signals.send(PipelineSignal::AuthInactive { reason });
    }

    /// Swap the publishable key. Clears the token and resets status to active.
    pub fn change_publishable_key(&self, key: PublishableKey) {
        *self.key.write() = key;
        *self.token.write() = None;
        if let Err(e) = self.kv.remove(kv::AUTH_TOKEN) {
            warn!(error = %e, "failed to clear stored token");
        }
        self.set_status(AuthStatus::Active);
        info!("publishable key changed");
    }

    fn set_status(&self, status: AuthStatus) {
        let changed = {
            let mut current = self.status.write();
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            if let Err(e) = self.kv.set(kv::AUTH_STATUS, &status) {
                warn!(error = %e, "failed to persist auth status");
            }
        }
    }
}
