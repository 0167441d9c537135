use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use trail_core::platform::Clock;
use trail_core::{ActivityClass, LocationSample};
use trail_settings::{FilterSettings, MovementThreshold};

/// Mutable filter state. Reset whenever tracking (re)starts.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    pub last_accepted: Option<LocationSample>,
    pub activity: ActivityClass,
    pub stationary_backoff_secs: u64,
}

/// Gates raw location fixes by inferred movement activity.
///
/// Only the most recent fresh sample of a batch is evaluated. It is accepted
/// when it is far enough from, and late enough after, the previously accepted
/// fix for the current activity class. While stationary, the required
/// interval grows with each rejection, so a parked device reports at a
/// decreasing rate.
pub struct ActivityFilter {
    settings: FilterSettings,
    clock: Arc<dyn Clock>,
    state: FilterState,
}

impl ActivityFilter {
    pub fn new(settings: FilterSettings, clock: Arc<dyn Clock>) -> Self {
        let state = FilterState {
            last_accepted: None,
            activity: ActivityClass::default(),
            stationary_backoff_secs: settings.stationary.base_secs,
        };
        Self {
            settings,
            clock,
            state,
        }
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn activity(&self) -> ActivityClass {
        self.state.activity
    }

    /// Update the activity class. Already-accepted samples are not
    /// re-evaluated; a class change resets the stationary backoff.
    pub fn set_activity(&mut self, activity: ActivityClass) {
        if activity != self.state.activity {
            debug!(from = %self.state.activity, to = %activity, "activity changed");
            self.state.activity = activity;
            self.reset_backoff();
        }
    }

    /// Forget the last accepted sample so the next fix bootstraps a session.
    pub fn reset(&mut self) {
        self.state.last_accepted = None;
        self.reset_backoff();
    }

    fn reset_backoff(&mut self) {
        self.state.stationary_backoff_secs = self.settings.stationary.base_secs;
    }

    fn threshold(&self) -> MovementThreshold {
        let f = &self.settings;
        match self.state.activity {
            ActivityClass::Walking | ActivityClass::Unsupported => f.walking,
            ActivityClass::Running => f.running,
            ActivityClass::Cycling => f.cycling,
            ActivityClass::Driving => f.driving,
            ActivityClass::Stationary => {
                MovementThreshold::new(f.stationary.min_distance_m, f.stationary.base_secs)
            }
        }
    }

    /// Accepted samples, in input order. At most one sample is returned.
    pub fn filter(&mut self, samples: &[LocationSample]) -> Vec<LocationSample> {
        let now = self.clock.now();
        let stale_before = now - Duration::seconds(self.settings.stale_after_secs as i64);

        let fresh: Vec<&LocationSample> = samples
            .iter()
            .filter(|s| {
                let keep = s.timestamp >= stale_before;
                if !keep {
                    debug!(timestamp = %s.timestamp, "dropping stale location sample");
                }
                keep
            })
            .collect();

        // Fixes may arrive out of order; judge the newest one.
        let Some(candidate) = fresh.iter().max_by_key(|s| s.timestamp).copied() else {
            return Vec::new();
        };

        let Some(previous) = self.state.last_accepted.as_ref() else {
            debug!("first fix of session accepted");
            return self.accept(candidate);
        };

        let distance = candidate.distance_to(previous);
        let elapsed_ms = (candidate.timestamp - previous.timestamp).num_milliseconds();
        let threshold = self.threshold();
        let moved = distance >= threshold.min_distance_m;

        let accepted = if self.state.activity == ActivityClass::Stationary {
            // A real move only needs the base interval; an unmoved fix is
            // admitted as a heartbeat once the backoff has elapsed.
            let base_ok = elapsed_ms >= secs_to_ms(threshold.min_interval_secs);
            let backoff_ok = elapsed_ms >= secs_to_ms(self.state.stationary_backoff_secs);
            (moved && base_ok) || backoff_ok
        } else {
            moved && elapsed_ms >= secs_to_ms(threshold.min_interval_secs)
        };

        if accepted {
            return self.accept(candidate);
        }

        if self.state.activity == ActivityClass::Stationary {
            let s = &self.settings.stationary;
            self.state.stationary_backoff_secs =
                (self.state.stationary_backoff_secs + s.step_secs).min(s.cap_secs);
        }
        debug!(
            activity = %self.state.activity,
            distance_m = distance,
            elapsed_ms,
            backoff_secs = self.state.stationary_backoff_secs,
            "location sample rejected"
        );
        Vec::new()
    }

    fn accept(&mut self, sample: &LocationSample) -> Vec<LocationSample> {
        self.state.last_accepted = Some(sample.clone());
        self.reset_backoff();
        vec![sample.clone()]
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    secs as i64 * 1000
}
