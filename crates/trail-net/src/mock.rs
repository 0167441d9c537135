use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use trail_core::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};
use trail_core::PipelineError;

use crate::endpoint::Endpoint;

/// Pre-programmed reply for deterministic testing without a server.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Respond with a status and raw body.
    Status(u16, String),
    /// Fail at the connection level.
    Error(PipelineError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn ok() -> Self {
        Self::Status(200, "{}".into())
    }

    pub fn status(status: u16) -> Self {
        Self::Status(status, String::new())
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::Status(status, body.to_string())
    }

    /// Successful token endpoint reply.
    pub fn token(token: &str, expires_in: i64) -> Self {
        Self::json(200, serde_json::json!({"token": token, "expires_in": expires_in}))
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

struct Route {
    method: HttpMethod,
    path: String,
    replies: VecDeque<MockReply>,
    last: Option<MockReply>,
}

impl Route {
    /// Next scripted reply; the final one repeats once the script runs out.
    fn next(&mut self) -> Option<MockReply> {
        match self.replies.pop_front() {
            Some(reply) => {
                self.last = Some(reply.clone());
                Some(reply)
            }
            None => self.last.clone(),
        }
    }
}

/// Transport with per-route scripted replies. Every request is recorded.
/// Unrouted requests get a 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script replies for one method + path.
    pub fn route(self, method: HttpMethod, path: impl Into<String>, replies: Vec<MockReply>) -> Self {
        self.routes.lock().push(Route {
            method,
            path: path.into(),
            replies: replies.into(),
            last: None,
        });
        self
    }

    pub fn on(self, endpoint: &Endpoint, replies: Vec<MockReply>) -> Self {
        self.route(endpoint.method(), endpoint.path(), replies)
    }

    /// Token endpoint that always issues a fresh one-hour token.
    pub fn with_token(self) -> Self {
        self.on(&Endpoint::Token, vec![MockReply::token("test-token", 3600)])
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Requests sent to the given path, in order.
    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn count_to(&self, endpoint: &Endpoint) -> usize {
        self.requests_to(&endpoint.path()).len()
    }

    fn next_reply(&self, request: &HttpRequest) -> Option<MockReply> {
        let mut routes = self.routes.lock();
        routes
            .iter_mut()
            .find(|r| r.method == request.method && r.path == request.path)
            .and_then(Route::next)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, PipelineError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let reply = self.next_reply(&request);
        self.requests.lock().push(request);

        let mut current = match reply {
            Some(reply) => reply,
            None => return Ok(HttpResponse { status: 404, body: "no route".into() }),
        };
        loop {
            match current {
                MockReply::Status(status, body) => return Ok(HttpResponse { status, body }),
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}
