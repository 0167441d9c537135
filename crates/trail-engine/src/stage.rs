use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use trail_core::PipelineError;

/// A typed asynchronous unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send;
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn execute(&self, input: Self::Input) -> Result<Self::Output, PipelineError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageState {
    Executing,
    Success,
    /// The queue had nothing left; natural termination, not an error.
    Exhausted,
    Failure { error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct StageRecord {
    pub pipeline: String,
    pub stage: &'static str,
    pub state: StageState,
    pub at: DateTime<Utc>,
}

const DEFAULT_CAPACITY: usize = 256;

/// Bounded log of recent stage transitions, shared by all pipelines.
pub struct StageJournal {
    capacity: usize,
    entries: Mutex<VecDeque<StageRecord>>,
}

impl Default for StageJournal {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StageJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    fn push(&self, pipeline: &str, stage: &'static str, state: StageState) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(StageRecord {
            pipeline: pipeline.to_string(),
            stage,
            state,
            at: Utc::now(),
        });
    }

    /// Execute a stage, logging and recording its transitions. The stage's
    /// result is returned unchanged, so `?` short-circuits the chain.
    pub async fn run<S: Stage>(
        &self,
        pipeline: &str,
        stage: &S,
        input: S::Input,
    ) -> Result<S::Output, PipelineError> {
        let name = stage.name();
        debug!(pipeline, stage = name, "stage executing");
        self.push(pipeline, name, StageState::Executing);

        let result = stage.execute(input).await;
        match &result {
            Ok(_) => {
                debug!(pipeline, stage = name, "stage succeeded");
                self.push(pipeline, name, StageState::Success);
            }
            Err(e) if e.is_exhaustion() => {
                debug!(pipeline, stage = name, "stage exhausted");
                self.push(pipeline, name, StageState::Exhausted);
            }
            Err(e) => {
                warn!(pipeline, stage = name, error = %e, kind = e.error_kind(), "stage failed");
                self.push(
                    pipeline,
                    name,
                    StageState::Failure {
                        error: e.error_kind().to_string(),
                    },
                );
            }
        }
        result
    }

    pub fn recent(&self) -> Vec<StageRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Names of stages that finished (any terminal state) for a pipeline,
    /// oldest first.
    pub fn completed_stages(&self, pipeline: &str) -> Vec<(&'static str, StageState)> {
        self.entries
            .lock()
            .iter()
            .filter(|r| r.pipeline == pipeline && r.state != StageState::Executing)
            .map(|r| (r.stage, r.state.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
