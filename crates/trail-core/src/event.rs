use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EventId;

/// Kind of telemetry record carried by an [`Event`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Activity,
    Location,
    Health,
    Checkin,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Location => "location",
            Self::Health => "health",
            Self::Checkin => "checkin",
        }
    }

    /// Value of the wire `type` field. Check-ins are sent untyped.
    pub fn wire_type(&self) -> Option<&'static str> {
        match self {
            Self::Checkin => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activity" => Ok(Self::Activity),
            "location" => Ok(Self::Location),
            "health" => Ok(Self::Health),
            "checkin" => Ok(Self::Checkin),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// One of the two independently queued and transmitted event streams.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Online,
    Custom,
}

impl Category {
    /// Transmission order: standard telemetry before custom markers.
    pub const ALL: [Category; 2] = [Category::Online, Category::Custom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Canonical telemetry record. Immutable once created: fields are only
/// reachable through accessors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: EventType,
    sorted_key: String,
    data: String,
    recorded_at: String,
}

impl Event {
    /// Create a new event with a fresh id.
    pub fn new(
        event_type: EventType,
        sorted_key: impl Into<String>,
        data: &serde_json::Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            sorted_key: sorted_key.into(),
            data: data.to_string(),
            recorded_at: recorded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Rebuild an event from persisted columns.
    pub fn restore(
        id: EventId,
        event_type: EventType,
        sorted_key: String,
        data: String,
        recorded_at: String,
    ) -> Self {
        Self {
            id,
            event_type,
            sorted_key,
            data,
            recorded_at,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn sorted_key(&self) -> &str {
        &self.sorted_key
    }

    /// Raw JSON payload as stored.
    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn recorded_at(&self) -> &str {
        &self.recorded_at
    }
}
