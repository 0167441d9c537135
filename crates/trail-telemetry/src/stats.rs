use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use trail_core::Category;

/// Delivery counters for one category.
#[derive(Default)]
struct CategoryStats {
    events_sent: AtomicU64,
    batches_sent: AtomicU64,
    failures: AtomicU64,
    quarantined: AtomicU64,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl CategoryStats {
    fn snapshot(&self) -> CategorySnapshot {
        CategorySnapshot {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            last_sync_at: *self.last_sync_at.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Process-wide sync statistics, shared by the transmission pipelines.
#[derive(Default)]
pub struct SyncStats {
    online: CategoryStats,
    custom: CategoryStats,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn category(&self, category: Category) -> &CategoryStats {
        match category {
            Category::Online => &self.online,
            Category::Custom => &self.custom,
        }
    }

    /// Record a batch the collector acknowledged.
    pub fn record_batch(&self, category: Category, events: usize, at: DateTime<Utc>) {
        let stats = self.category(category);
        stats.events_sent.fetch_add(events as u64, Ordering::Relaxed);
        stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        *stats.last_sync_at.write() = Some(at);
        *stats.last_error.write() = None;
    }

    /// Record events set aside because they can never be delivered.
    pub fn record_quarantined(&self, category: Category, events: usize) {
        self.category(category)
            .quarantined
            .fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, category: Category, error: &str) {
        let stats = self.category(category);
        stats.failures.fetch_add(1, Ordering::Relaxed);
        *stats.last_error.write() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            online: self.online.snapshot(),
            custom: self.custom.snapshot(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CategorySnapshot {
    pub events_sent: u64,
    pub batches_sent: u64,
    pub failures: u64,
    pub quarantined: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub online: CategorySnapshot,
    pub custom: CategorySnapshot,
}

impl SyncStatsSnapshot {
    pub fn get(&self, category: Category) -> &CategorySnapshot {
        match category {
            Category::Online => &self.online,
            Category::Custom => &self.custom,
        }
    }
}
