use trail_core::transport::{HttpMethod, HttpRequest};
use trail_core::{Category, DeviceId};

/// Collector endpoints used by the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Exchange the publishable key for an access token.
    Token,
    /// Update device metadata.
    Device(DeviceId),
    /// Batch upload for one queue.
    Events(Category),
}

impl Endpoint {
    pub fn method(&self) -> HttpMethod {
        match self {
            Self::Token | Self::Events(_) => HttpMethod::Post,
            Self::Device(_) => HttpMethod::Patch,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::Token => "/v1/auth/token".to_string(),
            Self::Device(id) => format!("/v1/devices/{id}"),
            Self::Events(Category::Online) => "/v1/events".to_string(),
            Self::Events(Category::Custom) => "/v1/events/custom".to_string(),
        }
    }

    /// The token endpoint never takes the reauthentication path.
    pub fn is_auth_endpoint(&self) -> bool {
        matches!(self, Self::Token)
    }

    pub fn request(&self) -> HttpRequest {
        HttpRequest::new(self.method(), self.path())
    }

    pub fn is_auth_path(path: &str) -> bool {
        path == Self::Token.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_and_methods() {
        let device = Endpoint::Device(DeviceId::from_raw("abc"));
        assert_eq!(device.path(), "/v1/devices/abc");
        assert_eq!(device.method(), HttpMethod::Patch);
        assert_eq!(Endpoint::Events(Category::Custom).path(), "/v1/events/custom");
        assert_eq!(Endpoint::Token.method(), HttpMethod::Post);
    }

    #[test]
    fn only_token_is_auth() {
        assert!(Endpoint::Token.is_auth_endpoint());
        assert!(!Endpoint::Events(Category::Online).is_auth_endpoint());
        assert!(Endpoint::is_auth_path("/v1/auth/token"));
        assert!(!Endpoint::is_auth_path("/v1/events"));
    }
}
