//! Page-at-a-time synchronization of one calendar from a raw event source.

mod engine;
mod pending;
mod report;

pub use engine::SyncEngine;
pub use report::{SyncMode, SyncReport};

use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::SyncResult;
use crate::event::CalendarId;

/// Terminal result of one run, shared with every coalesced caller.
pub type SyncOutcome = SyncResult<SyncReport>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    FullSyncInProgress,
    IncrementalSyncInProgress,
}

impl SyncPhase {
    pub fn is_running(&self) -> bool {
        !matches!(self, SyncPhase::Idle)
    }
}

impl From<SyncMode> for SyncPhase {
    fn from(mode: SyncMode) -> Self {
        match mode {
            SyncMode::Full => SyncPhase::FullSyncInProgress,
            SyncMode::Incremental => SyncPhase::IncrementalSyncInProgress,
        }
    }
}

/// Per-calendar run state: the observable phase, the run lock, and the
/// outcome channel of the run in flight (if any).
#[derive(Debug)]
pub struct CalendarSyncState {
    calendar_id: CalendarId,
    phase: watch::Sender<SyncPhase>,
    run_lock: tokio::sync::Mutex<()>,
    pub(crate) in_flight: Mutex<Option<watch::Receiver<Option<SyncOutcome>>>>,
}

impl CalendarSyncState {
    pub fn new(calendar_id: impl Into<CalendarId>) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        CalendarSyncState {
            calendar_id: calendar_id.into(),
            phase,
            run_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
        }
    }

    pub fn calendar_id(&self) -> &str {
        &self.calendar_id
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }
}
