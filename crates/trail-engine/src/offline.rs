use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use trail_core::platform::{Clock, Reachability};
use trail_core::signals::PipelineSignal;
use trail_core::PipelineError;
use trail_store::{kv, KvRepo};

/// How stale the stored last-online time may get while the device stays
/// reachable.
const PERSIST_EVERY_SECS: i64 = 300;

/// Pauses collection after a long offline stretch.
///
/// The last moment the device was known to be online is persisted, at most
/// every [`PERSIST_EVERY_SECS`] while online, so an offline period spanning a
/// restart still counts.
pub struct OfflineGuard {
    limit: Duration,
    clock: Arc<dyn Clock>,
    reachability: Arc<dyn Reachability>,
    kv: KvRepo,
    last_online: RwLock<Option<DateTime<Utc>>>,
    persisted_at: RwLock<Option<DateTime<Utc>>>,
    paused: AtomicBool,
    signals: broadcast::Sender<PipelineSignal>,
}

impl OfflineGuard {
    pub fn new(
        limit_hours: i64,
        clock: Arc<dyn Clock>,
        reachability: Arc<dyn Reachability>,
        kv: KvRepo,
        signals: broadcast::Sender<PipelineSignal>,
    ) -> Self {
        let last_online = kv.get::<DateTime<Utc>>(kv::LAST_ONLINE_AT).unwrap_or_else(|e| {
            warn!(error = %e, "stored last-online timestamp unreadable");
            None
        });
        Self {
            limit: Duration::hours(limit_hours),
            clock,
            reachability,
            kv,
            last_online: RwLock::new(last_online),
            persisted_at: RwLock::new(last_online),
            paused: AtomicBool::new(false),
            signals,
        }
    }

    pub fn last_online(&self) -> Option<DateTime<Utc>> {
        *self.last_online.read()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Record that the network is reachable now. Lifts a pause.
    pub fn mark_online(&self) {
        let now = self.clock.now();
        *self.last_online.write() = Some(now);
        let resumed = self.paused.swap(false, Ordering::SeqCst);
        if resumed {
            info!("network regained, collection resumed");
        }

        let due = self
            .persisted_at
            .read()
            .map_or(true, |at| now - at >= Duration::seconds(PERSIST_EVERY_SECS));
        if resumed || due {
            match self.kv.set(kv::LAST_ONLINE_AT, &now) {
                Ok(()) => *self.persisted_at.write() = Some(now),
                Err(e) => warn!(error = %e, "failed to persist last-online timestamp"),
            }
        }
    }

    /// `Err(NetworkDisconnectedGreater12Hours)` once the device has been
    /// offline longer than the limit.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.reachability.is_reachable() {
            self.mark_online();
            return Ok(());
        }

        let now = self.clock.now();
        let last = match self.last_online() {
            Some(last) => last,
            None => {
                // No history yet: start counting from now.
                *self.last_online.write() = Some(now);
                return Ok(());
            }
        };

        let offline_for = now - last;
        if offline_for <= self.limit {
            return Ok(());
        }
        if !self.paused.swap(true, Ordering::SeqCst) {
            warn!(offline_hours = offline_for.num_hours(), "offline too long, pausing collection");
            let _ = self.signals.send(PipelineSignal::CollectionPaused {
                offline_hours: offline_for.num_hours(),
            });
        }
        Err(PipelineError::NetworkDisconnectedGreater12Hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::platform::{ManualClock, ManualReachability};
    use trail_store::Database;

    struct Fixture {
        clock: ManualClock,
        reach: ManualReachability,
        kv: KvRepo,
        rx: broadcast::Receiver<PipelineSignal>,
        guard: OfflineGuard,
    }

    fn fixture(kv: KvRepo) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let reach = ManualReachability::new(true);
        let (tx, rx) = broadcast::channel(8);
        let guard = OfflineGuard::new(
            12,
            Arc::new(clock.clone()),
            Arc::new(reach.clone()),
            kv.clone(),
            tx,
        );
        Fixture { clock, reach, kv, rx, guard }
    }

    #[test]
    fn pauses_after_twelve_hours_offline() {
        let mut f = fixture(KvRepo::new(Database::in_memory().unwrap()));
        assert!(f.guard.check().is_ok());

        f.reach.set(false);
        f.clock.advance(Duration::hours(12));
        assert!(f.guard.check().is_ok());

        f.clock.advance(Duration::minutes(1));
        assert_eq!(
            f.guard.check(),
            Err(PipelineError::NetworkDisconnectedGreater12Hours)
        );
        assert!(f.guard.is_paused());
        assert_eq!(
            f.rx.try_recv().unwrap(),
            PipelineSignal::CollectionPaused { offline_hours: 12 }
        );

        // Only one pause signal per offline stretch.
        let _ = f.guard.check();
        assert!(f.rx.try_recv().is_err());
    }

    #[test]
    fn regaining_network_resets() {
        let f = fixture(KvRepo::new(Database::in_memory().unwrap()));
        f.guard.check().unwrap();
        f.reach.set(false);
        f.clock.advance(Duration::hours(13));
        assert!(f.guard.check().is_err());

        f.reach.set(true);
        assert!(f.guard.check().is_ok());
        assert!(!f.guard.is_paused());
    }

    #[test]
    fn last_online_survives_restart() {
        let kv = KvRepo::new(Database::in_memory().unwrap());
        let f = fixture(kv.clone());
        f.guard.mark_online();
        let recorded = f.guard.last_online();
        let stored: Option<DateTime<Utc>> = f.kv.get(kv::LAST_ONLINE_AT).unwrap();
        assert_eq!(stored, recorded);

        let restarted = fixture(kv);
        assert_eq!(restarted.guard.last_online(), recorded);
    }

    #[test]
    fn online_checks_write_the_timestamp_sparingly() {
        let f = fixture(KvRepo::new(Database::in_memory().unwrap()));
        let stored = || f.kv.get::<DateTime<Utc>>(kv::LAST_ONLINE_AT).unwrap();

        f.guard.check().unwrap();
        let first = stored();
        assert!(first.is_some());

        f.clock.advance(Duration::minutes(1));
        f.guard.check().unwrap();
        assert_eq!(stored(), first);
        assert!(f.guard.last_online() > first);

        f.clock.advance(Duration::minutes(4));
        f.guard.check().unwrap();
        assert_eq!(stored(), f.guard.last_online());
    }

    #[test]
    fn first_offline_check_starts_the_clock() {
        let f = fixture(KvRepo::new(Database::in_memory().unwrap()));
        f.reach.set(false);
        assert!(f.guard.check().is_ok());
        assert!(f.guard.last_online().is_some());
    }
}
