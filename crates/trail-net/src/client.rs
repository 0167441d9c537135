use std::sync::Arc;

use tracing::{info, instrument, warn};

use trail_core::auth::InactiveReason;
use trail_core::transport::{HttpRequest, HttpResponse, Transport};
use trail_core::PipelineError;

use crate::auth::AuthController;
use crate::endpoint::Endpoint;
use crate::retry::RetryPolicy;

/// Authenticated request layer.
///
/// - Attaches a bearer token, fetching one first when missing or expiring
/// - A 401 triggers exactly one reauthentication and one immediate resend;
///   a second 401 surfaces
/// - A 403 moves the account to inactive
/// - 5xx responses are retried on the [`RetryPolicy`] schedule
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    auth: Arc<AuthController>,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, auth: Arc<AuthController>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            auth,
            policy,
        }
    }

    pub fn auth(&self) -> &Arc<AuthController> {
        &self.auth
    }

    pub async fn call(
        &self,
        endpoint: &Endpoint,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse, PipelineError> {
        let mut request = endpoint.request();
        request.body = body;
        self.send(request).await
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, PipelineError> {
        if Endpoint::is_auth_path(&request.path) {
            return Err(PipelineError::BadRequest {
                status: 0,
                body: "token endpoint is owned by the auth controller".into(),
            });
        }

        let mut reauthenticated = false;
        loop {
            let token = self.auth.token().await?;
            let bearer = token.bearer();
            let result = self
                .policy
                .run(|| self.send_once(&request, &bearer))
                .await;

            match result {
                Ok(resp) => return Ok(resp),
                Err(PipelineError::AuthorizationFailed(body)) => {
                    if reauthenticated {
                        warn!("request rejected again after reauthentication");
                        return Err(PipelineError::AuthorizationFailed(body));
                    }
                    info!("authorization failed, reauthenticating");
                    reauthenticated = true;
                    self.auth.reauthenticate().await?;
                }
                Err(PipelineError::Forbidden(body)) => {
                    self.auth.mark_inactive(InactiveReason::TrialEnded);
                    return Err(PipelineError::Forbidden(body));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, request: &HttpRequest, bearer: &str) -> Result<HttpResponse, PipelineError> {
        let outgoing = request.clone().with_header("Authorization", bearer);
        self.transport.send(outgoing).await?.into_result()
    }
}
