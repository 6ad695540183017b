//! On-demand sync control with per-calendar coalescing.
//!
//! At most one run per calendar is in flight. A `force_sync` that finds a
//! run in flight waits for it and gets the same outcome instead of starting
//! a second network sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{SyncError, SyncResult};
use crate::event::{Calendar, CalendarId};
use crate::sync::{CalendarSyncState, SyncEngine, SyncOutcome, SyncPhase};

pub struct SyncCoordinator {
    engine: Arc<SyncEngine>,
    calendars: Mutex<HashMap<CalendarId, Arc<CalendarSyncState>>>,
    shutdown: CancellationToken,
}

impl SyncCoordinator {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        SyncCoordinator {
            engine,
            calendars: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Make a calendar known to the store. Re-registering keeps its records,
    /// sync token and timestamps.
    pub fn register(&self, calendar: Calendar) -> SyncResult<()> {
        let calendar_id = calendar.id.clone();
        self.engine.store().register_calendar(calendar)?;
        self.state(&calendar_id);
        Ok(())
    }

    fn state(&self, calendar_id: &str) -> Arc<CalendarSyncState> {
        let mut calendars = self
            .calendars
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        calendars
            .entry(calendar_id.to_string())
            .or_insert_with(|| Arc::new(CalendarSyncState::new(calendar_id)))
            .clone()
    }

    pub fn phase(&self, calendar_id: &str) -> SyncPhase {
        self.state(calendar_id).phase()
    }

    /// Watch phase transitions of one calendar.
    pub fn subscribe(&self, calendar_id: &str) -> watch::Receiver<SyncPhase> {
        self.state(calendar_id).subscribe()
    }

    /// Sync now, or join the run already in flight, and return its outcome.
    #[instrument(skip(self))]
    pub async fn force_sync(&self, calendar_id: &str) -> SyncOutcome {
        self.engine.store().calendar(calendar_id)?;
        let state = self.state(calendar_id);

        let mut outcome = {
            let mut in_flight = state
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // A closed channel means the run died without reporting.
            let joined = match in_flight.as_ref() {
                Some(rx) if rx.has_changed().is_ok() => Some(rx.clone()),
                _ => None,
            };
            match joined {
                Some(rx) => {
                    debug!(calendar = calendar_id, "joining sync in flight");
                    rx
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *in_flight = Some(rx.clone());
                    self.spawn_run(state.clone(), tx);
                    rx
                }
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(result) => match &*result {
                Some(result) => result.clone(),
                None => Err(SyncError::Cancelled),
            },
            Err(_) => Err(SyncError::Cancelled),
        };
        result
    }

    /// The run lives in its own task so dropping a `force_sync` future
    /// does not abandon the other waiters.
    fn spawn_run(&self, state: Arc<CalendarSyncState>, tx: watch::Sender<Option<SyncOutcome>>) {
        let engine = self.engine.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let outcome = engine.run(&state, &cancel).await;
            // Clear first so a caller woken by the outcome starts a fresh run.
            state
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            tx.send_replace(Some(outcome));
        });
    }

    /// Cancel in-flight runs at their next page boundary and refuse new ones.
    pub fn shutdown(&self) {
        debug!("shutting down sync coordinator");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
