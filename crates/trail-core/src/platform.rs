use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::registration::DeviceRegistration;

/// Wall clock used for staleness, token expiry and offline-duration checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to (for tests and replays).
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Network path availability with change notifications.
pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability driven by the host: the platform glue calls `set` from its
/// path monitor callback.
#[derive(Clone, Debug)]
pub struct ManualReachability {
    tx: Arc<watch::Sender<bool>>,
}

impl ManualReachability {
    pub fn new(reachable: bool) -> Self {
        let (tx, _) = watch::channel(reachable);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, reachable: bool) {
        self.tx.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
    }
}

impl Reachability for ManualReachability {
    fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Source of the current device registration payload.
pub trait DeviceInfo: Send + Sync {
    fn registration(&self) -> DeviceRegistration;
}

/// Registration held in memory; the host updates it when metadata changes.
#[derive(Clone, Debug)]
pub struct StaticDeviceInfo {
    registration: Arc<RwLock<DeviceRegistration>>,
}

impl StaticDeviceInfo {
    pub fn new(registration: DeviceRegistration) -> Self {
        Self {
            registration: Arc::new(RwLock::new(registration)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut DeviceRegistration)) {
        f(&mut *self.registration.write());
    }
}

impl DeviceInfo for StaticDeviceInfo {
    fn registration(&self) -> DeviceRegistration {
        self.registration.read().clone()
    }
}
