use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use trail_core::auth::{AuthStatus, PublishableKey};
use trail_core::platform::{Clock, DeviceInfo, Reachability, StaticDeviceInfo};
use trail_core::registration::DeviceRegistration;
use trail_core::signals::PipelineSignal;
use trail_core::transport::Transport;
use trail_core::{ActivityClass, Category, DeviceId, LocationSample, PipelineError};
use trail_net::{ApiClient, AuthController, RetryPolicy};
use trail_settings::TrailSettings;
use trail_store::{kv, Database, EventQueue, KvRepo};
use trail_telemetry::{SyncStats, SyncStatsSnapshot};

use crate::collection::CollectionPipeline;
use crate::filter::ActivityFilter;
use crate::manager::{ManagerOutcome, TransmissionManager};
use crate::mapper::ServiceEvent;
use crate::offline::OfflineGuard;
use crate::registration::RegistrationSync;
use crate::scheduler::DispatchScheduler;
use crate::stage::StageJournal;
use crate::transmission::{TransmissionContext, TransmissionPipeline};

const SIGNAL_CAPACITY: usize = 256;

/// Host-provided collaborators.
pub struct RuntimeDeps {
    pub transport: Arc<dyn Transport>,
    pub reachability: Arc<dyn Reachability>,
    pub clock: Arc<dyn Clock>,
    /// Registration source. Built from settings when absent.
    pub device_info: Option<Arc<dyn DeviceInfo>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueDepth {
    pub online: usize,
    pub custom: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RuntimeStatus {
    pub device_id: DeviceId,
    pub auth: AuthStatus,
    pub tracking: bool,
    pub reachable: bool,
    pub collection_paused: bool,
    pub last_online: Option<DateTime<Utc>>,
    pub queued: QueueDepth,
    pub sync: SyncStatsSnapshot,
}

/// Composition root: owns every pipeline component and the background tasks
/// that drive them.
pub struct Runtime {
    settings: TrailSettings,
    device_id: DeviceId,
    reachability: Arc<dyn Reachability>,
    online: EventQueue,
    custom: EventQueue,
    auth: Arc<AuthController>,
    guard: Arc<OfflineGuard>,
    collection: Arc<CollectionPipeline>,
    manager: Arc<TransmissionManager>,
    filter: Mutex<ActivityFilter>,
    stats: Arc<SyncStats>,
    journal: Arc<StageJournal>,
    signals: broadcast::Sender<PipelineSignal>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn build(
        settings: TrailSettings,
        db: Database,
        deps: RuntimeDeps,
    ) -> Result<Self, PipelineError> {
        let kv = KvRepo::new(db.clone());
        let device_id = load_or_create_device_id(&kv)?;
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        let online = EventQueue::new(db.clone(), Category::Online);
        let custom = EventQueue::new(db, Category::Custom);

        let t = &settings.transmission;
        let policy = RetryPolicy::from_secs(t.max_retries, &t.retry_backoff_secs);
        let auth = Arc::new(
            AuthController::new(
                deps.transport.clone(),
                kv.clone(),
                deps.clock.clone(),
                device_id.clone(),
                PublishableKey::new(settings.api.publishable_key.clone()),
                signals.clone(),
            )
            .with_retry(policy.clone())
            .with_purge(vec![online.clone(), custom.clone()]),
        );
        let client = Arc::new(ApiClient::new(deps.transport, auth.clone(), policy));

        let device_info = deps
            .device_info
            .unwrap_or_else(|| Arc::new(default_device_info(&settings, &device_id)));
        let registration = Arc::new(RegistrationSync::new(device_info, client.clone(), kv.clone()));

        let guard = Arc::new(OfflineGuard::new(
            settings.collection.offline_limit_hours,
            deps.clock.clone(),
            deps.reachability.clone(),
            kv,
            signals.clone(),
        ));
        let stats = Arc::new(SyncStats::new());
        let journal = Arc::new(StageJournal::default());

        let ctx = TransmissionContext {
            reachability: deps.reachability.clone(),
            registration,
            client,
            clock: deps.clock.clone(),
            stats: stats.clone(),
            journal: journal.clone(),
            signals: signals.clone(),
            device_id: device_id.clone(),
            sdk_version: settings.api.sdk_version.clone(),
            batch_size: t.batch_size,
        };
        let manager = Arc::new(TransmissionManager::new(
            Arc::new(TransmissionPipeline::new(online.clone(), ctx.clone())),
            Arc::new(TransmissionPipeline::new(custom.clone(), ctx)),
        ));

        let collection = Arc::new(CollectionPipeline::new(
            online.clone(),
            custom.clone(),
            guard.clone(),
            auth.clone(),
            signals.clone(),
            journal.clone(),
        ));
        let filter = Mutex::new(ActivityFilter::new(settings.filter.clone(), deps.clock));

        info!(device_id = %device_id, auth = ?auth.status(), "runtime built");

        Ok(Self {
            settings,
            device_id,
            reachability: deps.reachability,
            online,
            custom,
            auth,
            guard,
            collection,
            manager,
            filter,
            stats,
            journal,
            signals,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn auth(&self) -> &Arc<AuthController> {
        &self.auth
    }

    pub fn journal(&self) -> &Arc<StageJournal> {
        &self.journal
    }

    pub fn manager(&self) -> &Arc<TransmissionManager> {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineSignal> {
        self.signals.subscribe()
    }

    /// Spawn the dispatch scheduler and the lifecycle watcher.
    pub fn start(&self) {
        let scheduler = DispatchScheduler::new(self.manager.clone(), &self.settings.scheduler);
        let scheduler = scheduler.spawn(self.signals.subscribe(), self.cancel.clone());
        let watcher = tokio::spawn(watch_lifecycle(
            self.reachability.subscribe(),
            self.signals.subscribe(),
            self.guard.clone(),
            self.collection.clone(),
            self.signals.clone(),
            self.cancel.clone(),
        ));

        let mut tasks = self.tasks.lock();
        tasks.push(scheduler);
        tasks.push(watcher);
        info!("runtime started");
    }

    /// Cancel background tasks and wait for them to finish. Queued events stay
    /// on disk.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("runtime stopped");
    }

    /// Begin a tracking session: the next fix bootstraps the filter.
    pub fn start_tracking(&self) {
        self.filter.lock().reset();
        self.collection.set_enabled(true);
        info!("tracking started");
    }

    pub fn stop_tracking(&self) {
        self.collection.set_enabled(false);
        info!("tracking stopped");
    }

    pub fn is_tracking(&self) -> bool {
        self.collection.is_enabled()
    }

    /// Filter raw fixes and queue the accepted ones.
    pub async fn ingest_locations(&self, samples: &[LocationSample]) -> Result<usize, PipelineError> {
        let (accepted, activity) = {
            let mut filter = self.filter.lock();
            (filter.filter(samples), filter.activity())
        };
        if accepted.is_empty() {
            return Ok(0);
        }
        let raw = accepted
            .into_iter()
            .map(|sample| ServiceEvent::Location { sample, activity })
            .collect();
        self.collection.submit(raw, Category::Online).await
    }

    /// Update the filter's activity class and record the change.
    pub async fn set_activity(
        &self,
        activity: ActivityClass,
        at: DateTime<Utc>,
    ) -> Result<usize, PipelineError> {
        self.filter.lock().set_activity(activity);
        let event = ServiceEvent::Activity {
            activity,
            confidence: None,
            timestamp: at,
        };
        self.collection.submit(vec![event], Category::Online).await
    }

    pub async fn submit(
        &self,
        raw: Vec<ServiceEvent>,
        category: Category,
    ) -> Result<usize, PipelineError> {
        self.collection.submit(raw, category).await
    }

    /// Route one service event: fixes go through the filter, activity updates
    /// retune it, everything else is queued in its default category.
    pub async fn ingest(&self, event: ServiceEvent) -> Result<usize, PipelineError> {
        match event {
            ServiceEvent::Location { sample, activity } => {
                self.filter.lock().set_activity(activity);
                self.ingest_locations(&[sample]).await
            }
            ServiceEvent::Activity { activity, .. } => {
                self.filter.lock().set_activity(activity);
                self.collection.submit(vec![event], Category::Online).await
            }
            other => {
                let category = other.default_category();
                self.collection.submit(vec![other], category).await
            }
        }
    }

    /// Drain both queues now, bypassing the scheduler.
    pub async fn flush(&self) -> Result<ManagerOutcome, PipelineError> {
        self.manager.execute().await
    }

    /// Wake the scheduler as the platform does on background-task entry.
    pub fn background_task(&self) {
        let _ = self.signals.send(PipelineSignal::BackgroundTask);
    }

    pub fn change_publishable_key(&self, key: PublishableKey) {
        self.auth.change_publishable_key(key);
    }

    /// Drop every queued event. Returns the number removed.
    #[instrument(skip(self))]
    pub fn purge(&self) -> Result<usize, PipelineError> {
        let removed = self.online.delete_all()? + self.custom.delete_all()?;
        info!(removed, "queues purged");
        Ok(removed)
    }

    pub fn status(&self) -> Result<RuntimeStatus, PipelineError> {
        Ok(RuntimeStatus {
            device_id: self.device_id.clone(),
            auth: self.auth.status(),
            tracking: self.is_tracking(),
            reachable: self.reachability.is_reachable(),
            collection_paused: self.guard.is_paused(),
            last_online: self.guard.last_online(),
            queued: QueueDepth {
                online: self.online.count()?,
                custom: self.custom.count()?,
            },
            sync: self.stats.snapshot(),
        })
    }
}

fn load_or_create_device_id(kv: &KvRepo) -> Result<DeviceId, PipelineError> {
    match kv.get::<DeviceId>(kv::DEVICE_ID) {
        Ok(Some(id)) => Ok(id),
        Ok(None) => {
            let id = DeviceId::new();
            kv.set(kv::DEVICE_ID, &id)
                .map_err(|e| PipelineError::DatabaseWriteFailed(e.to_string()))?;
            info!(device_id = %id, "generated device id");
            Ok(id)
        }
        Err(e) => Err(PipelineError::DatabaseReadFailed(e.to_string())),
    }
}

fn default_device_info(settings: &TrailSettings, device_id: &DeviceId) -> StaticDeviceInfo {
    let d = &settings.device;
    StaticDeviceInfo::new(DeviceRegistration {
        device_id: device_id.clone(),
        sdk_version: settings.api.sdk_version.clone(),
        os_name: std::env::consts::OS.to_string(),
        os_version: "unknown".to_string(),
        device_model: d.model.clone(),
        app_version: d.app_version.clone(),
        push_token: d.push_token.clone(),
        location_permission: d.location_permission.clone(),
        motion_permission: d.motion_permission.clone(),
    })
}

/// Forwards reachability changes onto the signal bus and stops collection
/// once the account goes inactive.
async fn watch_lifecycle(
    mut reach_rx: watch::Receiver<bool>,
    mut signal_rx: broadcast::Receiver<PipelineSignal>,
    guard: Arc<OfflineGuard>,
    collection: Arc<CollectionPipeline>,
    signals: broadcast::Sender<PipelineSignal>,
    cancel: CancellationToken,
) {
    if *reach_rx.borrow_and_update() {
        guard.mark_online();
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = reach_rx.changed() => {
                if changed.is_err() {
                    debug!("reachability source dropped");
                    break;
                }
                let reachable = *reach_rx.borrow_and_update();
                info!(reachable, "reachability changed");
                if reachable {
                    guard.mark_online();
                }
                let _ = signals.send(PipelineSignal::ReachabilityChanged { reachable });
            }
            received = signal_rx.recv() => match received {
                Ok(PipelineSignal::AuthInactive { reason }) => {
                    warn!(%reason, "account inactive, stopping collection");
                    collection.set_enabled(false);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use trail_core::auth::InactiveReason;
    use trail_core::platform::{ManualClock, ManualReachability};
    use trail_core::Coordinate;
    use trail_net::{MockReply, MockTransport};

    struct Fixture {
        db: Database,
        mock: Arc<MockTransport>,
        clock: ManualClock,
        reach: ManualReachability,
        runtime: Runtime,
    }

    fn fixture(mock: MockTransport) -> Fixture {
        let db = Database::in_memory().unwrap();
        let mock = Arc::new(mock.with_token());
        let clock = ManualClock::new(Utc::now());
        let reach = ManualReachability::new(true);
        let runtime = Runtime::build(
            TrailSettings::default(),
            db.clone(),
            RuntimeDeps {
                transport: mock.clone(),
                reachability: Arc::new(reach.clone()),
                clock: Arc::new(clock.clone()),
                device_info: None,
            },
        )
        .unwrap();
        Fixture {
            db,
            mock,
            clock,
            reach,
            runtime,
        }
    }

    #[test]
    fn device_id_is_stable_across_builds() {
        let f = fixture(MockTransport::new());
        let again = Runtime::build(
            TrailSettings::default(),
            f.db.clone(),
            RuntimeDeps {
                transport: f.mock.clone(),
                reachability: Arc::new(f.reach.clone()),
                clock: Arc::new(f.clock.clone()),
                device_info: None,
            },
        )
        .unwrap();
        assert_eq!(again.device_id(), f.runtime.device_id());
    }

    #[tokio::test]
    async fn location_ingest_runs_through_filter() {
        let f = fixture(MockTransport::new());
        let now = f.clock.now();
        let sample = LocationSample::new(Coordinate::new(52.5, 13.4), 5.0, now);

        assert_eq!(f.runtime.ingest_locations(&[sample.clone()]).await.unwrap(), 1);
        // Same spot a second later is below every threshold.
        f.clock.advance(Duration::seconds(1));
        let again = LocationSample::new(Coordinate::new(52.5, 13.4), 5.0, f.clock.now());
        assert_eq!(f.runtime.ingest_locations(&[again]).await.unwrap(), 0);

        let status = f.runtime.status().unwrap();
        assert_eq!(status.queued.online, 1);
        assert_eq!(status.auth, AuthStatus::Active);
    }

    #[tokio::test]
    async fn checkins_route_to_custom_queue() {
        let f = fixture(MockTransport::new());
        f.runtime
            .ingest(ServiceEvent::Checkin {
                marker: "trip_start".into(),
                payload: serde_json::Value::Null,
                timestamp: f.clock.now(),
            })
            .await
            .unwrap();
        f.runtime
            .set_activity(ActivityClass::Driving, f.clock.now())
            .await
            .unwrap();
        let status = f.runtime.status().unwrap();
        assert_eq!(status.queued.custom, 1);
        assert_eq!(status.queued.online, 1);
    }

    #[tokio::test]
    async fn stop_tracking_rejects_submissions() {
        let f = fixture(MockTransport::new());
        f.runtime.stop_tracking();
        let err = f
            .runtime
            .set_activity(ActivityClass::Walking, f.clock.now())
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::CollectionStopped);

        f.runtime.start_tracking();
        assert!(f.runtime.is_tracking());
        assert_eq!(
            f.runtime
                .set_activity(ActivityClass::Walking, f.clock.now())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn purge_empties_both_queues() {
        let f = fixture(MockTransport::new());
        f.runtime
            .set_activity(ActivityClass::Running, f.clock.now())
            .await
            .unwrap();
        f.runtime
            .ingest(ServiceEvent::Checkin {
                marker: "m".into(),
                payload: serde_json::Value::Null,
                timestamp: f.clock.now(),
            })
            .await
            .unwrap();
        assert_eq!(f.runtime.purge().unwrap(), 2);
        assert_eq!(f.runtime.status().unwrap().queued.online, 0);
    }

    #[tokio::test]
    async fn inactive_account_stops_collection() {
        let f = fixture(MockTransport::new());
        f.runtime.start();
        tokio::task::yield_now().await;

        f.runtime.auth().mark_inactive(InactiveReason::TrialEnded);
        for _ in 0..10 {
            if !f.runtime.is_tracking() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!f.runtime.is_tracking());
        f.runtime.stop().await;
    }

    #[tokio::test]
    async fn regained_network_is_announced() {
        let f = fixture(MockTransport::new().on(
            &trail_net::Endpoint::Events(Category::Online),
            vec![MockReply::ok()],
        ));
        f.reach.set(false);
        let mut rx = f.runtime.subscribe();
        f.runtime.start();
        tokio::task::yield_now().await;

        f.reach.set(true);
        let signal = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if let Ok(PipelineSignal::ReachabilityChanged { reachable }) = rx.recv().await {
                    return reachable;
                }
            }
        })
        .await
        .unwrap();
        assert!(signal);
        assert!(f.runtime.status().unwrap().last_online.is_some());
        f.runtime.stop().await;
    }
}
