pub mod collection;
pub mod filter;
pub mod manager;
pub mod mapper;
pub mod offline;
pub mod registration;
pub mod runtime;
pub mod scheduler;
pub mod stage;
pub mod transmission;

pub use collection::CollectionPipeline;
pub use filter::ActivityFilter;
pub use manager::{ManagerOutcome, TransmissionManager};
pub use mapper::{EventMapper, ServiceEvent};
pub use offline::OfflineGuard;
pub use registration::RegistrationSync;
pub use runtime::{QueueDepth, Runtime, RuntimeDeps, RuntimeStatus};
pub use scheduler::{Dispatch, DispatchScheduler};
pub use stage::{Stage, StageJournal, StageState};
pub use transmission::{
    RunOutcome, RunReport, TransmissionBatch, TransmissionContext, TransmissionPipeline,
};
