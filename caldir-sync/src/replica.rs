//! The outward surface: timeline queries plus on-demand sync.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::{StoreResult, SyncResult};
use crate::event::Calendar;
use crate::source::RawEventSource;
use crate::store::{EventStore, LocalStore};
use crate::sync::{SyncEngine, SyncOutcome, SyncPhase};
use crate::timeline::{Occurrence, Timeline, TimelineBuilder};

/// A local, queryable replica of one or more remote calendars.
///
/// Queries answer from whatever is committed, even mid-sync.
pub struct CalendarReplica {
    timeline: TimelineBuilder,
    coordinator: Arc<SyncCoordinator>,
}

impl CalendarReplica {
    pub fn new(
        source: Arc<dyn RawEventSource>,
        store: Arc<dyn EventStore>,
        config: SyncConfig,
    ) -> Self {
        let timeline = TimelineBuilder::new(store.clone(), config.timeline.clone());
        let engine = Arc::new(SyncEngine::new(source, store, config));
        CalendarReplica {
            timeline,
            coordinator: Arc::new(SyncCoordinator::new(engine)),
        }
    }

    /// Build a replica over a [`LocalStore`] at `config.store_dir`, or in
    /// memory when no directory is configured.
    pub fn open(source: Arc<dyn RawEventSource>, config: SyncConfig) -> StoreResult<Self> {
        let store: Arc<dyn EventStore> = match config.expanded_store_dir() {
            Some(dir) => Arc::new(LocalStore::open(dir)?),
            None => Arc::new(LocalStore::in_memory()),
        };
        Ok(Self::new(source, store, config))
    }

    pub fn register(&self, calendar: Calendar) -> SyncResult<()> {
        self.coordinator.register(calendar)
    }

    pub fn next_occurrence(
        &self,
        calendar_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Occurrence>> {
        self.timeline.next_occurrence(calendar_id, at)
    }

    pub fn occurrences_in_range(
        &self,
        calendar_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Timeline> {
        self.timeline.occurrences_in_range(calendar_id, from, to)
    }

    pub fn active_after(&self, calendar_id: &str, at: DateTime<Utc>) -> StoreResult<Timeline> {
        self.timeline.active_after(calendar_id, at)
    }

    pub async fn force_sync(&self, calendar_id: &str) -> SyncOutcome {
        self.coordinator.force_sync(calendar_id).await
    }

    pub fn phase(&self, calendar_id: &str) -> SyncPhase {
        self.coordinator.phase(calendar_id)
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
