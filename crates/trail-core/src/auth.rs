use std::fmt;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Tokens within this many seconds of expiry are refreshed before use.
pub const TOKEN_EXPIRY_BUFFER_SECONDS: i64 = 60;

/// Publishable key issued to the host application (redacted in Debug).
#[derive(Clone)]
pub struct PublishableKey(pub SecretString);

impl PublishableKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for PublishableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PublishableKey([REDACTED])")
    }
}

/// Bearer token returned by the token endpoint.
#[derive(Clone)]
pub struct AuthToken {
    pub token: SecretString,
    pub expires_in_seconds: i64,
    pub issued_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, expires_in_seconds: i64, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_in_seconds,
            issued_at,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.expires_in_seconds)
    }

    /// True once `now` is inside the refresh buffer before expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() - Duration::seconds(TOKEN_EXPIRY_BUFFER_SECONDS) <= now
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }

    pub fn to_record(&self) -> TokenRecord {
        TokenRecord {
            token: self.token.expose_secret().to_string(),
            expires_in_seconds: self.expires_in_seconds,
            issued_at: self.issued_at,
        }
    }

    pub fn from_record(record: TokenRecord) -> Self {
        Self::new(record.token, record.expires_in_seconds, record.issued_at)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("expires_in_seconds", &self.expires_in_seconds)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Persisted form of [`AuthToken`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub expires_in_seconds: i64,
    pub issued_at: DateTime<Utc>,
}

/// Whether the SDK may talk to the collector at all.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Active,
    Inactive,
}

/// Why the auth status went inactive.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    InvalidPublishableKey,
    TrialEnded,
}

impl fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPublishableKey => f.write_str("invalid_publishable_key"),
            Self::TrialEnded => f.write_str("trial_ended"),
        }
    }
}
