use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use trail_core::{Category, PipelineError};

use crate::transmission::{RunGuard, RunOutcome, RunReport, TransmissionPipeline};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagerOutcome {
    AlreadyRunning,
    /// One report per pipeline that ran, in execution order.
    Completed(Vec<RunReport>),
}

impl ManagerOutcome {
    /// Every pipeline that ran left its queue empty.
    pub fn drained(&self) -> bool {
        match self {
            Self::AlreadyRunning => false,
            Self::Completed(reports) => reports.iter().all(|r| r.drained),
        }
    }

    pub fn events_sent(&self) -> usize {
        match self {
            Self::AlreadyRunning => 0,
            Self::Completed(reports) => reports.iter().map(|r| r.events_sent).sum(),
        }
    }
}

/// Runs the online pipeline, then the custom one. A failure in the online
/// drain skips the custom drain for this run.
pub struct TransmissionManager {
    online: Arc<TransmissionPipeline>,
    custom: Arc<TransmissionPipeline>,
    running: AtomicBool,
}

impl TransmissionManager {
    pub fn new(online: Arc<TransmissionPipeline>, custom: Arc<TransmissionPipeline>) -> Self {
        Self {
            online,
            custom,
            running: AtomicBool::new(false),
        }
    }

    pub fn pipeline(&self, category: Category) -> &Arc<TransmissionPipeline> {
        match category {
            Category::Online => &self.online,
            Category::Custom => &self.custom,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[instrument(skip(self))]
    pub async fn execute(&self) -> Result<ManagerOutcome, PipelineError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("transmission already in flight");
            return Ok(ManagerOutcome::AlreadyRunning);
        };
        self.run_all().await
    }

    async fn run_all(&self) -> Result<ManagerOutcome, PipelineError> {
        let mut reports = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            match self.pipeline(category).execute().await {
                Ok(RunOutcome::Completed(report)) => reports.push(report),
                // Someone else is draining this queue; treat it as not drained.
                Ok(RunOutcome::AlreadyRunning) => reports.push(RunReport {
                    category: Some(category),
                    ..RunReport::default()
                }),
                Err(e) => {
                    warn!(category = %category, error = %e, "transmission failed");
                    return Err(e);
                }
            }
        }
        let sent: usize = reports.iter().map(|r| r.events_sent).sum();
        if sent > 0 {
            info!(events = sent, "transmission complete");
        }
        Ok(ManagerOutcome::Completed(reports))
    }
}
