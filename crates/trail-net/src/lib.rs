pub mod auth;
pub mod client;
pub mod endpoint;
pub mod http;
pub mod mock;
pub mod retry;

pub use auth::AuthController;
pub use client::ApiClient;
pub use endpoint::Endpoint;
pub use http::HttpTransport;
pub use mock::{MockReply, MockTransport};
pub use retry::RetryPolicy;
