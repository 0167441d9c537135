use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use trail_core::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};
use trail_core::PipelineError;

/// reqwest-backed transport against a fixed base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_error(&self, e: reqwest::Error) -> PipelineError {
        if e.is_timeout() {
            PipelineError::Timeout(self.timeout)
        } else {
            PipelineError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, PipelineError> {
        let url = format!("{}{}", self.base_url, request.path);
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .header("Accept", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| self.map_error(e))?;
        debug!(status, bytes = body.len(), "response received");

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_json_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/events"))
            .and(header("authorization", "Bearer t1"))
            .and(body_json(serde_json::json!({"events": []})))
            .respond_with(ResponseTemplate::new(201).set_body_string("{\"ok\":true}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), Duration::from_secs(5)).unwrap();
        let resp = transport
            .send(
                HttpRequest::new(HttpMethod::Post, "/v1/events")
                    .with_header("Authorization", "Bearer t1")
                    .with_body(serde_json::json!({"events": []})),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/devices/d1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        let resp = transport
            .send(HttpRequest::new(HttpMethod::Patch, "/v1/devices/d1"))
            .await
            .unwrap();
        assert_eq!(resp.status, 503);
        assert!(matches!(
            resp.into_result(),
            Err(PipelineError::InternalServerError { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn slow_server_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), Duration::from_millis(50)).unwrap();
        let err = transport
            .send(HttpRequest::new(HttpMethod::Post, "/v1/events"))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        // Port 9 (discard) is closed on test hosts.
        let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let err = transport
            .send(HttpRequest::new(HttpMethod::Get, "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
    }
}
