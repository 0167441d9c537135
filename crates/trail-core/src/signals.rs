use serde::{Deserialize, Serialize};

use crate::auth::InactiveReason;
use crate::event::Category;

/// Cross-component notifications, published on a broadcast channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PipelineSignal {
    #[serde(rename = "data_available")]
    DataAvailable { category: Category, count: usize },

    #[serde(rename = "data_sent")]
    DataSent { category: Category, count: usize },

    #[serde(rename = "reachability_changed")]
    ReachabilityChanged { reachable: bool },

    #[serde(rename = "collection_paused")]
    CollectionPaused { offline_hours: i64 },

    #[serde(rename = "auth_inactive")]
    AuthInactive { reason: InactiveReason },

    #[serde(rename = "background_task")]
    BackgroundTask,
}

impl PipelineSignal {
    pub fn signal_type(&self) -> &'static str {
        match self {
            Self::DataAvailable { .. } => "data_available",
            Self::DataSent { .. } => "data_sent",
            Self::ReachabilityChanged { .. } => "reachability_changed",
            Self::CollectionPaused { .. } => "collection_paused",
            Self::AuthInactive { .. } => "auth_inactive",
            Self::BackgroundTask => "background_task",
        }
    }
}
