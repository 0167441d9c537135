use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use trail_core::signals::PipelineSignal;
use trail_core::{Category, Event, PipelineError};
use trail_net::AuthController;
use trail_store::EventQueue;

use crate::mapper::{EventMapper, ServiceEvent};
use crate::offline::OfflineGuard;
use crate::stage::{Stage, StageJournal};

struct OfflineCheck {
    guard: Arc<OfflineGuard>,
}

#[async_trait]
impl Stage for OfflineCheck {
    type Input = Vec<ServiceEvent>;
    type Output = Vec<ServiceEvent>;

    fn name(&self) -> &'static str {
        "offline_check"
    }

    async fn execute(&self, input: Vec<ServiceEvent>) -> Result<Vec<ServiceEvent>, PipelineError> {
        self.guard.check()?;
        Ok(input)
    }
}

struct MapEvents {
    mapper: EventMapper,
}

#[async_trait]
impl Stage for MapEvents {
    type Input = Vec<ServiceEvent>;
    type Output = Vec<Event>;

    fn name(&self) -> &'static str {
        "map_events"
    }

    async fn execute(&self, input: Vec<ServiceEvent>) -> Result<Vec<Event>, PipelineError> {
        let events = self.mapper.map(&input);
        if events.is_empty() {
            return Err(PipelineError::SensorToDataMappingFailed);
        }
        Ok(events)
    }
}

struct AppendEvents {
    queue: EventQueue,
}

#[async_trait]
impl Stage for AppendEvents {
    type Input = Vec<Event>;
    type Output = usize;

    fn name(&self) -> &'static str {
        "append_events"
    }

    async fn execute(&self, input: Vec<Event>) -> Result<usize, PipelineError> {
        self.queue.append(&input)?;
        Ok(input.len())
    }
}

/// Maps raw service events and appends them to the queue of the requested
/// category, then announces that data is available.
pub struct CollectionPipeline {
    offline: OfflineCheck,
    map: MapEvents,
    append_online: AppendEvents,
    append_custom: AppendEvents,
    auth: Arc<AuthController>,
    enabled: AtomicBool,
    signals: broadcast::Sender<PipelineSignal>,
    journal: Arc<StageJournal>,
}

impl CollectionPipeline {
    pub fn new(
        online: EventQueue,
        custom: EventQueue,
        guard: Arc<OfflineGuard>,
        auth: Arc<AuthController>,
        signals: broadcast::Sender<PipelineSignal>,
        journal: Arc<StageJournal>,
    ) -> Self {
        Self {
            offline: OfflineCheck { guard },
            map: MapEvents {
                mapper: EventMapper,
            },
            append_online: AppendEvents { queue: online },
            append_custom: AppendEvents { queue: custom },
            auth,
            enabled: AtomicBool::new(true),
            signals,
            journal,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the number of events queued.
    #[instrument(skip(self, raw), fields(category = %category, raw = raw.len()))]
    pub async fn submit(
        &self,
        raw: Vec<ServiceEvent>,
        category: Category,
    ) -> Result<usize, PipelineError> {
        if !self.auth.is_active() {
            return Err(PipelineError::AuthInactive);
        }
        if !self.is_enabled() {
            return Err(PipelineError::CollectionStopped);
        }

        let name = pipeline_name(category);
        let append = match category {
            Category::Online => &self.append_online,
            Category::Custom => &self.append_custom,
        };

        let raw = self.journal.run(name, &self.offline, raw).await?;
        let events = self.journal.run(name, &self.map, raw).await?;
        let count = self.journal.run(name, append, events).await?;

        debug!(count, "events queued");
        let _ = self
            .signals
            .send(PipelineSignal::DataAvailable { category, count });
        Ok(count)
    }
}

fn pipeline_name(category: Category) -> &'static str {
    match category {
        Category::Online => "collect.online",
        Category::Custom => "collect.custom",
    }
}
