use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use trail_core::{ActivityClass, Category, Event, EventType, LocationSample};

/// Raw output of the platform services, before mapping to queued events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceEvent {
    Location {
        sample: LocationSample,
        #[serde(default)]
        activity: ActivityClass,
    },
    Activity {
        activity: ActivityClass,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    Health {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Trip marker placed by the host app.
    Checkin {
        marker: String,
        #[serde(default)]
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl ServiceEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Location { sample, .. } => sample.timestamp,
            Self::Activity { timestamp, .. }
            | Self::Health { timestamp, .. }
            | Self::Checkin { timestamp, .. } => *timestamp,
        }
    }

    /// Queue this event belongs in when the caller does not choose one.
    pub fn default_category(&self) -> Category {
        match self {
            Self::Checkin { .. } => Category::Custom,
            _ => Category::Online,
        }
    }
}

/// Maps service events into immutable queue events. Records that cannot be
/// represented (non-finite or out-of-range coordinates) are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventMapper;

impl EventMapper {
    pub fn map(&self, raw: &[ServiceEvent]) -> Vec<Event> {
        raw.iter().filter_map(|e| self.map_one(e)).collect()
    }

    fn map_one(&self, raw: &ServiceEvent) -> Option<Event> {
        let at = raw.timestamp();
        let sorted_key = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        match raw {
            ServiceEvent::Location { sample, activity } => {
                let c = &sample.coordinate;
                if !valid_coordinate(c.latitude, c.longitude) {
                    debug!(lat = c.latitude, lon = c.longitude, "skipping invalid coordinate");
                    return None;
                }
                let mut data = json!({
                    "latitude": c.latitude,
                    "longitude": c.longitude,
                    "altitude": c.altitude,
                    "horizontal_accuracy": sample.horizontal_accuracy,
                    "activity": activity.as_str(),
                });
                if let Some(speed) = sample.speed.filter(|v| v.is_finite()) {
                    data["speed"] = json!(speed);
                }
                if let Some(bearing) = sample.bearing.filter(|v| v.is_finite()) {
                    data["bearing"] = json!(bearing);
                }
                Some(Event::new(EventType::Location, sorted_key, &data, at))
            }
            ServiceEvent::Activity {
                activity,
                confidence,
                ..
            } => {
                let mut data = json!({ "activity": activity.as_str() });
                if let Some(confidence) = confidence {
                    data["confidence"] = json!(confidence);
                }
                Some(Event::new(EventType::Activity, sorted_key, &data, at))
            }
            ServiceEvent::Health { name, payload, .. } => {
                let data = json!({ "name": name, "payload": payload });
                Some(Event::new(EventType::Health, sorted_key, &data, at))
            }
            ServiceEvent::Checkin { marker, payload, .. } => {
                let data = json!({ "marker": marker, "payload": payload });
                Some(Event::new(EventType::Checkin, sorted_key, &data, at))
            }
        }
    }
}

fn valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}
