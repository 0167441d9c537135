use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use trail_core::platform::{Clock, Reachability};
use trail_core::signals::PipelineSignal;
use trail_core::transport::HttpResponse;
use trail_core::{Category, DeviceId, Event, PipelineError};
use trail_net::{ApiClient, Endpoint};
use trail_store::EventQueue;
use trail_telemetry::SyncStats;

use crate::registration::RegistrationSync;
use crate::stage::{Stage, StageJournal};

/// Events read from one queue, paired with the collector's response once sent.
#[derive(Debug)]
pub struct TransmissionBatch {
    /// Rows read from the queue, including any later quarantined.
    pub fetched: usize,
    pub events: Vec<Event>,
    /// Events whose stored data cannot be put on the wire, with the reason.
    pub quarantined: Vec<(Event, String)>,
    pub response: Option<HttpResponse>,
}

struct ReachabilityCheck {
    reachability: Arc<dyn Reachability>,
}

#[async_trait]
impl Stage for ReachabilityCheck {
    type Input = ();
    type Output = ();

    fn name(&self) -> &'static str {
        "reachability"
    }

    async fn execute(&self, _: ()) -> Result<(), PipelineError> {
        if self.reachability.is_reachable() {
            Ok(())
        } else {
            Err(PipelineError::NetworkDisconnected)
        }
    }
}

struct EnsureRegistered {
    sync: Arc<RegistrationSync>,
}

#[async_trait]
impl Stage for EnsureRegistered {
    type Input = ();
    type Output = ();

    fn name(&self) -> &'static str {
        "ensure_registered"
    }

    async fn execute(&self, _: ()) -> Result<(), PipelineError> {
        self.sync.ensure_registered().await.map(|_| ())
    }
}

struct ReadBatch {
    queue: EventQueue,
    batch_size: usize,
}

#[async_trait]
impl Stage for ReadBatch {
    type Input = ();
    type Output = TransmissionBatch;

    fn name(&self) -> &'static str {
        "read_batch"
    }

    async fn execute(&self, _: ()) -> Result<TransmissionBatch, PipelineError> {
        let events = self.queue.fetch_oldest(self.batch_size)?;
        if events.is_empty() {
            return Err(PipelineError::EmptyResult);
        }
        Ok(TransmissionBatch {
            fetched: events.len(),
            events,
            quarantined: Vec::new(),
            response: None,
        })
    }
}

struct MapPayload {
    device_id: DeviceId,
    sdk_version: String,
}

#[async_trait]
impl Stage for MapPayload {
    type Input = TransmissionBatch;
    type Output = (TransmissionBatch, Value);

    fn name(&self) -> &'static str {
        "map_payload"
    }

    async fn execute(
        &self,
        mut batch: TransmissionBatch,
    ) -> Result<(TransmissionBatch, Value), PipelineError> {
        let mut records = Vec::with_capacity(batch.events.len());
        let mut deliverable = Vec::with_capacity(batch.events.len());
        for event in std::mem::take(&mut batch.events) {
            match wire_record(&event) {
                Ok(record) => {
                    records.push(record);
                    deliverable.push(event);
                }
                Err(e) => {
                    warn!(event_id = %event.id(), error = %e, "event cannot be mapped, setting aside");
                    batch.quarantined.push((event, e.to_string()));
                }
            }
        }
        batch.events = deliverable;
        let payload = json!({
            "device_id": self.device_id,
            "source": { "sdk_version": self.sdk_version },
            "events": records,
        });
        Ok((batch, payload))
    }
}

/// `{id, data, type?, recorded_at}`; check-ins carry no `type`.
fn wire_record(event: &Event) -> Result<Value, PipelineError> {
    let data: Value = serde_json::from_str(event.data()).map_err(|e| {
        PipelineError::PayloadMappingFailed(format!("event {}: {e}", event.id()))
    })?;
    let mut record = json!({
        "id": event.id(),
        "data": data,
        "recorded_at": event.recorded_at(),
    });
    if let Some(t) = event.event_type().wire_type() {
        record["type"] = json!(t);
    }
    Ok(record)
}

struct SendBatch {
    client: Arc<ApiClient>,
    endpoint: Endpoint,
}

#[async_trait]
impl Stage for SendBatch {
    type Input = (TransmissionBatch, Value);
    type Output = TransmissionBatch;

    fn name(&self) -> &'static str {
        "send"
    }

    async fn execute(
        &self,
        (mut batch, payload): (TransmissionBatch, Value),
    ) -> Result<TransmissionBatch, PipelineError> {
        if batch.events.is_empty() {
            debug!("nothing deliverable in batch");
            return Ok(batch);
        }
        let response = self.client.call(&self.endpoint, Some(payload)).await?;
        batch.response = Some(response);
        Ok(batch)
    }
}

struct DeleteSent {
    queue: EventQueue,
}

/// What one pass through the stages did to the queue.
struct Delivered {
    fetched: usize,
    sent: usize,
    quarantined: usize,
}

#[async_trait]
impl Stage for DeleteSent {
    type Input = TransmissionBatch;
    type Output = Delivered;

    fn name(&self) -> &'static str {
        "delete_sent"
    }

    async fn execute(&self, batch: TransmissionBatch) -> Result<Delivered, PipelineError> {
        self.queue.delete(&batch.events)?;
        let quarantined = self.queue.quarantine(&batch.quarantined)?;
        Ok(Delivered {
            fetched: batch.fetched,
            sent: batch.events.len(),
            quarantined,
        })
    }
}

/// Summary of one pipeline run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub category: Option<Category>,
    pub batches: usize,
    pub events_sent: usize,
    /// The queue was empty (or short of a full batch) when the run ended.
    pub drained: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run of this pipeline was in flight; nothing was done.
    AlreadyRunning,
    Completed(RunReport),
}

/// Clears the in-flight flag however the run ends.
pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Collaborators shared by both transmission pipelines.
#[derive(Clone)]
pub struct TransmissionContext {
    pub reachability: Arc<dyn Reachability>,
    pub registration: Arc<RegistrationSync>,
    pub client: Arc<ApiClient>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<SyncStats>,
    pub journal: Arc<StageJournal>,
    pub signals: broadcast::Sender<PipelineSignal>,
    pub device_id: DeviceId,
    pub sdk_version: String,
    pub batch_size: usize,
}

/// Drains one category's queue: reachability, registration, read, map, send,
/// delete, and again while full batches keep coming.
pub struct TransmissionPipeline {
    category: Category,
    name: &'static str,
    running: AtomicBool,
    reachability: ReachabilityCheck,
    register: EnsureRegistered,
    read: ReadBatch,
    map: MapPayload,
    send: SendBatch,
    delete: DeleteSent,
    clock: Arc<dyn Clock>,
    stats: Arc<SyncStats>,
    journal: Arc<StageJournal>,
    signals: broadcast::Sender<PipelineSignal>,
}

impl TransmissionPipeline {
    pub fn new(queue: EventQueue, ctx: TransmissionContext) -> Self {
        let category = queue.category();
        Self {
            category,
            name: match category {
                Category::Online => "transmit.online",
                Category::Custom => "transmit.custom",
            },
            running: AtomicBool::new(false),
            reachability: ReachabilityCheck {
                reachability: ctx.reachability,
            },
            register: EnsureRegistered {
                sync: ctx.registration,
            },
            read: ReadBatch {
                queue: queue.clone(),
                batch_size: ctx.batch_size.max(1),
            },
            map: MapPayload {
                device_id: ctx.device_id,
                sdk_version: ctx.sdk_version,
            },
            send: SendBatch {
                client: ctx.client,
                endpoint: Endpoint::Events(category),
            },
            delete: DeleteSent { queue },
            clock: ctx.clock,
            stats: ctx.stats,
            journal: ctx.journal,
            signals: ctx.signals,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run until the queue is drained or a stage fails. A call made while a
    /// run is in flight returns [`RunOutcome::AlreadyRunning`] immediately.
    #[instrument(skip(self), fields(category = %self.category))]
    pub async fn execute(&self) -> Result<RunOutcome, PipelineError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("run already in flight");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let mut report = RunReport {
            category: Some(self.category),
            ..RunReport::default()
        };
        loop {
            match self.run_batch().await {
                Ok(done) => {
                    if done.sent > 0 {
                        report.batches += 1;
                        report.events_sent += done.sent;
                        self.stats.record_batch(self.category, done.sent, self.clock.now());
                    }
                    if done.quarantined > 0 {
                        self.stats.record_quarantined(self.category, done.quarantined);
                    }
                    if done.fetched < self.read.batch_size {
                        return Ok(self.finish(report));
                    }
                }
                Err(e) if e.is_exhaustion() => return Ok(self.finish(report)),
                Err(e) => {
                    self.stats.record_failure(self.category, e.error_kind());
                    return Err(e);
                }
            }
        }
    }

    async fn run_batch(&self) -> Result<Delivered, PipelineError> {
        let j = &self.journal;
        j.run(self.name, &self.reachability, ()).await?;
        j.run(self.name, &self.register, ()).await?;
        let batch = j.run(self.name, &self.read, ()).await?;
        let mapped = j.run(self.name, &self.map, batch).await?;
        let sent = j.run(self.name, &self.send, mapped).await?;
        j.run(self.name, &self.delete, sent).await
    }

    fn finish(&self, mut report: RunReport) -> RunOutcome {
        report.drained = true;
        if report.batches > 0 {
            info!(
                batches = report.batches,
                events = report.events_sent,
                "queue drained"
            );
            let _ = self.signals.send(PipelineSignal::DataSent {
                category: self.category,
                count: report.events_sent,
            });
        }
        RunOutcome::Completed(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trail_core::auth::PublishableKey;
    use trail_core::platform::{ManualClock, ManualReachability, StaticDeviceInfo};
    use trail_core::registration::DeviceRegistration;
    use trail_core::EventType;
    use trail_net::{AuthController, MockReply, MockTransport, RetryPolicy};
    use trail_store::{Database, KvRepo};

    const EVENTS: Endpoint = Endpoint::Events(Category::Online);

    struct Fixture {
        mock: Arc<MockTransport>,
        queue: EventQueue,
        reach: ManualReachability,
        stats: Arc<SyncStats>,
        rx: broadcast::Receiver<PipelineSignal>,
        pipeline: TransmissionPipeline,
    }

    fn device_id() -> DeviceId {
        DeviceId::from_raw("dev-1")
    }

    fn fixture(mock: MockTransport, batch_size: usize) -> Fixture {
        let db = Database::in_memory().unwrap();
        let mock = Arc::new(
            mock.with_token()
                .on(&Endpoint::Device(device_id()), vec![MockReply::ok()]),
        );
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let reach = ManualReachability::new(true);
        let (tx, rx) = broadcast::channel(16);
        let auth = Arc::new(AuthController::new(
            mock.clone(),
            KvRepo::new(db.clone()),
            clock.clone(),
            device_id(),
            PublishableKey::new("pk"),
            tx.clone(),
        ));
        let client = Arc::new(ApiClient::new(mock.clone(), auth, RetryPolicy::none()));
        let info = StaticDeviceInfo::new(DeviceRegistration {
            device_id: device_id(),
            sdk_version: "0.1.0".into(),
            os_name: "linux".into(),
            os_version: "6.1".into(),
            device_model: "test".into(),
            app_version: None,
            push_token: None,
            location_permission: "granted".into(),
            motion_permission: "granted".into(),
        });
        let registration = Arc::new(RegistrationSync::new(
            Arc::new(info),
            client.clone(),
            KvRepo::new(db.clone()),
        ));
        let stats = Arc::new(SyncStats::new());
        let queue = EventQueue::new(db, Category::Online);
        let pipeline = TransmissionPipeline::new(
            queue.clone(),
            TransmissionContext {
                reachability: Arc::new(reach.clone()),
                registration,
                client,
                clock,
                stats: stats.clone(),
                journal: Arc::new(StageJournal::default()),
                signals: tx,
                device_id: device_id(),
                sdk_version: "0.1.0".into(),
                batch_size,
            },
        );
        Fixture {
            mock,
            queue,
            reach,
            stats,
            rx,
            pipeline,
        }
    }

    fn seed(queue: &EventQueue, n: usize) {
        let events: Vec<Event> = (0..n)
            .map(|i| {
                Event::new(
                    EventType::Location,
                    format!("{i:04}"),
                    &json!({"i": i}),
                    Utc::now(),
                )
            })
            .collect();
        queue.append(&events).unwrap();
    }

    #[tokio::test]
    async fn drains_in_batches_and_signals_once() {
        let mut f = fixture(MockTransport::new().on(&EVENTS, vec![MockReply::ok()]), 10);
        seed(&f.queue, 25);

        let outcome = f.pipeline.execute().await.unwrap();
        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(report.batches, 3);
        assert_eq!(report.events_sent, 25);
        assert!(report.drained);
        assert_eq!(f.queue.count().unwrap(), 0);

        let sizes: Vec<usize> = f
            .mock
            .requests_to(&EVENTS.path())
            .iter()
            .map(|r| r.body.as_ref().unwrap()["events"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);

        assert_eq!(
            f.rx.try_recv().unwrap(),
            PipelineSignal::DataSent {
                category: Category::Online,
                count: 25
            }
        );
        assert!(f.rx.try_recv().is_err());
        assert_eq!(f.stats.snapshot().online.events_sent, 25);
    }

    #[tokio::test]
    async fn exact_multiple_ends_on_empty_read() {
        let f = fixture(MockTransport::new().on(&EVENTS, vec![MockReply::ok()]), 5);
        seed(&f.queue, 10);
        f.pipeline.execute().await.unwrap();
        assert_eq!(f.mock.count_to(&EVENTS), 2);
        assert_eq!(f.queue.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_queue_finishes_silently() {
        let mut f = fixture(MockTransport::new(), 10);
        let outcome = f.pipeline.execute().await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed(RunReport {
                category: Some(Category::Online),
                batches: 0,
                events_sent: 0,
                drained: true,
            })
        );
        assert!(f.rx.try_recv().is_err());
        assert_eq!(f.mock.count_to(&EVENTS), 0);
    }

    #[tokio::test]
    async fn payload_shape() {
        let f = fixture(MockTransport::new().on(&EVENTS, vec![MockReply::ok()]), 10);
        seed(&f.queue, 1);
        f.pipeline.execute().await.unwrap();

        let sent = f.mock.requests_to(&EVENTS.path());
        let body = sent[0].body.as_ref().unwrap();
        assert_eq!(body["device_id"], "dev-1");
        assert_eq!(body["source"]["sdk_version"], "0.1.0");
        let record = &body["events"][0];
        assert_eq!(record["type"], "location");
        assert_eq!(record["data"]["i"], 0);
        assert!(record["id"].is_string());
        assert!(record["recorded_at"].is_string());
        assert_eq!(sent[0].header("authorization"), Some("Bearer test-token"));
    }

    #[test]
    fn checkin_record_has_no_type() {
        let event = Event::new(EventType::Checkin, "k", &json!({"marker": "m"}), Utc::now());
        let record = wire_record(&event).unwrap();
        assert!(record.get("type").is_none());
        assert_eq!(record["data"]["marker"], "m");
    }

    #[test]
    fn corrupt_data_fails_mapping() {
        let event = Event::restore(
            trail_core::EventId::new(),
            EventType::Location,
            "k".into(),
            "{not json".into(),
            "2026-05-01T08:00:00.000Z".into(),
        );
        assert!(matches!(
            wire_record(&event),
            Err(PipelineError::PayloadMappingFailed(_))
        ));
    }

    fn restore_with_data(data: &str) -> Event {
        Event::restore(
            trail_core::EventId::new(),
            EventType::Location,
            "bad".into(),
            data.into(),
            "2026-05-01T08:00:00.000Z".into(),
        )
    }

    #[tokio::test]
    async fn unreadable_event_is_quarantined_and_the_rest_delivered() {
        let f = fixture(MockTransport::new().on(&EVENTS, vec![MockReply::ok()]), 10);
        f.queue.append(&[restore_with_data("{not json")]).unwrap();
        seed(&f.queue, 2);

        let RunOutcome::Completed(report) = f.pipeline.execute().await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(report.events_sent, 2);
        assert!(report.drained);
        assert_eq!(f.queue.count().unwrap(), 0);
        assert_eq!(f.queue.quarantined().unwrap(), 1);

        let sent = f.mock.requests_to(&EVENTS.path());
        assert_eq!(sent.len(), 1);
        let records = sent[0].body.as_ref().unwrap()["events"].as_array().unwrap().len();
        assert_eq!(records, 2);
        assert_eq!(f.stats.snapshot().online.quarantined, 1);
    }

    #[tokio::test]
    async fn batch_of_only_unreadable_events_sends_nothing() {
        let mut f = fixture(MockTransport::new().on(&EVENTS, vec![MockReply::ok()]), 2);
        f.queue
            .append(&[restore_with_data("{"), restore_with_data("[1,")])
            .unwrap();
        seed(&f.queue, 1);

        let RunOutcome::Completed(report) = f.pipeline.execute().await.unwrap() else {
            panic!("expected a completed run");
        };
        // First pass quarantined a full batch, the second sent the survivor.
        assert_eq!(report.batches, 1);
        assert_eq!(report.events_sent, 1);
        assert_eq!(f.queue.quarantined().unwrap(), 2);
        assert_eq!(f.queue.count().unwrap(), 0);
        assert_eq!(f.mock.count_to(&EVENTS), 1);
        assert!(matches!(
            f.rx.try_recv(),
            Ok(PipelineSignal::DataSent { count: 1, .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_fails_without_touching_network() {
        let f = fixture(MockTransport::new(), 10);
        seed(&f.queue, 3);
        f.reach.set(false);
        assert_eq!(
            f.pipeline.execute().await,
            Err(PipelineError::NetworkDisconnected)
        );
        assert_eq!(f.mock.call_count(), 0);
        assert_eq!(f.queue.count().unwrap(), 3);
        assert_eq!(
            f.stats.snapshot().online.last_error.as_deref(),
            Some("network_disconnected")
        );
    }

    #[tokio::test]
    async fn rejected_batch_is_kept() {
        let f = fixture(MockTransport::new().on(&EVENTS, vec![MockReply::status(422)]), 10);
        seed(&f.queue, 4);
        let err = f.pipeline.execute().await.unwrap_err();
        assert!(matches!(err, PipelineError::BadRequest { status: 422, .. }));
        assert_eq!(f.queue.count().unwrap(), 4);
        assert!(!f.pipeline.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_execute_is_a_no_op() {
        let f = fixture(
            MockTransport::new().on(
                &EVENTS,
                vec![MockReply::delayed(
                    std::time::Duration::from_secs(1),
                    MockReply::ok(),
                )],
            ),
            10,
        );
        seed(&f.queue, 2);

        let (first, second) = tokio::join!(f.pipeline.execute(), async {
            tokio::task::yield_now().await;
            f.pipeline.execute().await
        });
        assert!(matches!(first, Ok(RunOutcome::Completed(_))));
        assert_eq!(second, Ok(RunOutcome::AlreadyRunning));
        assert_eq!(f.mock.count_to(&EVENTS), 1);
    }
}
