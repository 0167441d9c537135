use std::time::Duration;

/// Typed error taxonomy for the event pipeline.
/// Classifies failures as transport, auth, storage, mapping, exhaustion, or fatal-account.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    // Transport
    #[error("network disconnected")]
    NetworkDisconnected,
    #[error("network disconnected for more than 12 hours")]
    NetworkDisconnectedGreater12Hours,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),

    // Auth
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("publishable key is invalid")]
    InvalidPublishableKey,
    #[error("authentication is inactive")]
    AuthInactive,

    // Server
    #[error("internal server error {status}: {body}")]
    InternalServerError { status: u16, body: String },
    #[error("request rejected {status}: {body}")]
    BadRequest { status: u16, body: String },

    // Storage
    #[error("database read failed: {0}")]
    DatabaseReadFailed(String),
    #[error("database write failed: {0}")]
    DatabaseWriteFailed(String),

    // Mapping
    #[error("sensor data could not be mapped to events")]
    SensorToDataMappingFailed,
    #[error("payload mapping failed: {0}")]
    PayloadMappingFailed(String),

    // Exhaustion
    #[error("queue is empty")]
    EmptyResult,

    // Lifecycle
    #[error("collection is stopped")]
    CollectionStopped,
}

impl PipelineError {
    /// A 5xx from the collector; the only error the request layer backs off on.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::InternalServerError { .. })
    }

    /// Failures that need corrective action outside the process.
    pub fn is_unrestorable(&self) -> bool {
        matches!(
            self,
            Self::InvalidPublishableKey | Self::Forbidden(_) | Self::AuthInactive
        )
    }

    /// Natural end of a queue drain rather than a failure.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::EmptyResult)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NetworkDisconnected => "network_disconnected",
            Self::NetworkDisconnectedGreater12Hours => "network_disconnected_greater_12_hours",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::AuthorizationFailed(_) => "authorization_failed",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidPublishableKey => "invalid_publishable_key",
            Self::AuthInactive => "auth_inactive",
            Self::InternalServerError { .. } => "internal_server_error",
            Self::BadRequest { .. } => "bad_request",
            Self::DatabaseReadFailed(_) => "database_read_failed",
            Self::DatabaseWriteFailed(_) => "database_write_failed",
            Self::SensorToDataMappingFailed => "sensor_to_data_mapping_failed",
            Self::PayloadMappingFailed(_) => "payload_mapping_failed",
            Self::EmptyResult => "empty_result",
            Self::CollectionStopped => "collection_stopped",
        }
    }

    /// Classify a non-2xx HTTP status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::AuthorizationFailed(body),
            403 => Self::Forbidden(body),
            500..=599 => Self::InternalServerError { status, body },
            _ => Self::BadRequest { status, body },
        }
    }
}
