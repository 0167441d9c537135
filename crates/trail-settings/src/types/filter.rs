use serde::{Deserialize, Serialize};

/// Distance/interval gate for one activity class.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementThreshold {
    pub min_distance_m: f64,
    pub min_interval_secs: u64,
}

impl MovementThreshold {
    pub const fn new(min_distance_m: f64, min_interval_secs: u64) -> Self {
        Self {
            min_distance_m,
            min_interval_secs,
        }
    }
}

/// Stationary gating: the required interval starts at `base_secs` and grows
/// by `step_secs` per rejected sample, up to `cap_secs`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationarySettings {
    pub min_distance_m: f64,
    pub base_secs: u64,
    pub step_secs: u64,
    pub cap_secs: u64,
}

impl Default for StationarySettings {
    fn default() -> Self {
        Self {
            min_distance_m: 10.0,
            base_secs: 10,
            step_secs: 10,
            cap_secs: 3600,
        }
    }
}

/// Location sample filter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSettings {
    /// Samples older than this at evaluation time are dropped.
    pub stale_after_secs: u64,
    pub stationary: StationarySettings,
    /// Also used for the `unsupported` class.
    pub walking: MovementThreshold,
    pub running: MovementThreshold,
    pub cycling: MovementThreshold,
    pub driving: MovementThreshold,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            stationary: StationarySettings::default(),
            walking: MovementThreshold::new(10.0, 20),
            running: MovementThreshold::new(20.0, 20),
            cycling: MovementThreshold::new(20.0, 10),
            driving: MovementThreshold::new(40.0, 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_threshold_override() {
        let filter: FilterSettings =
            serde_json::from_str(r#"{"driving": {"minDistanceM": 100.0, "minIntervalSecs": 30}}"#)
                .unwrap();
        assert_eq!(filter.driving, MovementThreshold::new(100.0, 30));
        assert_eq!(filter.walking, MovementThreshold::new(10.0, 20));
        assert_eq!(filter.stationary.cap_secs, 3600);
    }
}
