//! The sync run: fetch pages, classify records, commit each page atomically.
//!
//! A run is either full (no usable sync token) or incremental. Both walk
//! the same page loop; only the final page's batch advances the sync token,
//! so a run that stops early leaves the token where the last completed run
//! put it. A rejected token restarts the run as a full sync.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{OrphanedException, SyncError, SyncResult};
use crate::event::EventId;
use crate::raw::{Ingested, PageEnd, RawEvent, RawPage};
use crate::source::{PageRequest, RawEventSource, SourceError};
use crate::store::{EventStore, WriteBatch};

use super::pending::PendingExceptions;
use super::report::{SyncMode, SyncReport};
use super::{CalendarSyncState, SyncPhase};

/// Per-attempt bookkeeping. Discarded when a run restarts as a full sync.
struct RunState {
    pending: PendingExceptions,
    /// Ids the remote mentioned as live during a full sync.
    seen: HashSet<EventId>,
    report: SyncReport,
}

impl RunState {
    fn new(calendar_id: &str, mode: SyncMode) -> Self {
        RunState {
            pending: PendingExceptions::new(),
            seen: HashSet::new(),
            report: SyncReport::new(calendar_id, mode),
        }
    }
}

pub struct SyncEngine {
    source: Arc<dyn RawEventSource>,
    store: Arc<dyn EventStore>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn RawEventSource>,
        store: Arc<dyn EventStore>,
        config: SyncConfig,
    ) -> Self {
        SyncEngine {
            source,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one sync of the calendar to completion.
    ///
    /// Runs for the same calendar are serialized on the state's run lock.
    /// Cancellation is honoured between pages (and while waiting on a
    /// fetch); nothing past the last committed page is written.
    #[instrument(skip_all, fields(calendar = %state.calendar_id()))]
    pub async fn run(
        &self,
        state: &CalendarSyncState,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncReport> {
        let _guard = state.run_lock.lock().await;
        let result = self.run_locked(state, cancel).await;
        state.set_phase(SyncPhase::Idle);

        match &result {
            Ok(report) => info!(%report, "sync completed"),
            Err(e) => warn!(error = %e, retryable = e.is_retryable(), "sync failed"),
        }
        result
    }

    async fn run_locked(
        &self,
        state: &CalendarSyncState,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncReport> {
        let calendar_id = state.calendar_id();
        let calendar = self.store.calendar(calendar_id)?;
        let mut sync_token = calendar.usable_sync_token().map(String::from);
        let mut fallbacks = 0;

        loop {
            let attempt = match &sync_token {
                Some(token) => {
                    let request = PageRequest::incremental(calendar_id, token);
                    self.run_pages(state, request, SyncMode::Incremental, cancel).await
                }
                None => {
                    let time_min = Utc::now() - self.config.full_sync_lookback();
                    let request = PageRequest::full(calendar_id, time_min);
                    self.run_pages(state, request, SyncMode::Full, cancel).await
                }
            };

            match attempt {
                Ok(mut report) => {
                    report.full_sync_fallbacks = fallbacks;
                    return Ok(report);
                }
                Err(SyncError::TokenInvalid) if fallbacks < self.config.max_full_sync_restarts => {
                    fallbacks += 1;
                    warn!(
                        calendar = calendar_id,
                        fallbacks,
                        "sync token rejected, restarting as full sync"
                    );
                    // The held token is dead either way; drop it so a failed
                    // restart does not present it again.
                    let mut batch = WriteBatch::new();
                    batch.clear_sync_token();
                    self.store.apply(calendar_id, batch)?;
                    sync_token = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_pages(
        &self,
        state: &CalendarSyncState,
        first: PageRequest,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncReport> {
        let calendar_id = state.calendar_id();
        state.set_phase(mode.into());
        info!(calendar = calendar_id, %mode, "starting sync");

        let mut run = RunState::new(calendar_id, mode);
        let mut request = first;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let page = self.fetch(&request, cancel).await?;
            let end = page.end()?;
            let mut batch = self.classify(calendar_id, page.items, &mut run)?;
            if let Some(tz) = page.time_zone {
                batch.set_time_zone(tz);
            }

            match end {
                PageEnd::NextPage(page_token) => {
                    self.store.apply(calendar_id, batch)?;
                    run.report.pages += 1;
                    debug!(calendar = calendar_id, pages = run.report.pages, "page applied");
                    request = request.next_page(page_token);
                }
                PageEnd::Complete { sync_token } => {
                    self.finish(calendar_id, mode, &mut batch, &mut run)?;
                    let synced_at = Utc::now();
                    batch.set_sync_token(sync_token, synced_at);
                    self.store.apply(calendar_id, batch)?;
                    run.report.pages += 1;
                    run.report.synced_at = synced_at;
                    return Ok(run.report);
                }
            }
        }
    }

    async fn fetch(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> SyncResult<RawPage> {
        let page_timeout = self.config.page_timeout;
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            fetched = timeout(page_timeout, self.source.fetch_page(request)) => fetched,
        };

        match fetched {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(SourceError::TokenInvalid)) => Err(SyncError::TokenInvalid),
            Ok(Err(SourceError::Transport(message))) => Err(SyncError::TransportFailure(message)),
            Err(_) => Err(SyncError::TransportFailure(format!(
                "page fetch timed out after {}",
                humantime::format_duration(page_timeout)
            ))),
        }
    }

    /// Turn one page of raw records into a batch.
    ///
    /// An exception is only written once its master is known: already in the
    /// store, or upserted earlier in this page. Otherwise it waits in the
    /// run's pending queue.
    fn classify(
        &self,
        calendar_id: &str,
        items: Vec<RawEvent>,
        run: &mut RunState,
    ) -> SyncResult<WriteBatch> {
        let mut batch = WriteBatch::new();
        // Masters this page has written (true) or removed (false).
        let mut masters: HashMap<EventId, bool> = HashMap::new();

        for raw in items {
            match raw.ingest()? {
                Ingested::Delete(id) => {
                    let dropped = run.pending.drop_master(&id);
                    if dropped > 0 {
                        debug!(
                            calendar = calendar_id,
                            master = %id,
                            dropped,
                            "master cancelled, dropping held exceptions"
                        );
                    }
                    run.seen.remove(&id);
                    masters.insert(id.clone(), false);
                    batch.remove(id);
                    run.report.removed += 1;
                }
                Ingested::Upsert(record) => {
                    run.seen.insert(record.id.clone());
                    if let Some(master_id) = record.master_id() {
                        let master_known = match masters.get(master_id) {
                            Some(known) => *known,
                            None => self
                                .store
                                .get_by_id(calendar_id, master_id)?
                                .is_some_and(|m| m.is_master()),
                        };
                        if master_known {
                            batch.upsert(record);
                            run.report.upserted += 1;
                        } else {
                            debug!(
                                calendar = calendar_id,
                                event = %record.id,
                                master = %master_id,
                                "holding exception until master arrives"
                            );
                            run.pending.hold(record);
                        }
                    } else {
                        let id = record.id.clone();
                        let is_master = record.is_master();
                        batch.upsert(record);
                        run.report.upserted += 1;
                        masters.insert(id.clone(), is_master);
                        if is_master {
                            for exception in run.pending.release(&id) {
                                batch.upsert(exception);
                                run.report.upserted += 1;
                            }
                        }
                    }
                }
            }
        }

        Ok(batch)
    }

    /// Final-page work: keep orphaned exceptions, and on a full sync delete
    /// whatever the remote no longer mentions.
    fn finish(
        &self,
        calendar_id: &str,
        mode: SyncMode,
        batch: &mut WriteBatch,
        run: &mut RunState,
    ) -> SyncResult<()> {
        for exception in run.pending.drain() {
            let orphan = OrphanedException {
                event_id: exception.id.clone(),
                master_id: exception.master_id().cloned().unwrap_or_default(),
            };
            warn!(calendar = calendar_id, %orphan, "retaining orphaned exception");
            run.report.orphaned.push(orphan);
            batch.upsert(exception);
            run.report.upserted += 1;
        }

        if mode == SyncMode::Full {
            let mut stale: Vec<EventId> = self
                .store
                .event_ids(calendar_id)?
                .into_iter()
                .filter(|id| !run.seen.contains(id))
                .collect();
            stale.sort();
            for id in stale {
                debug!(
                    calendar = calendar_id,
                    event = %id,
                    "removing record absent from full sync"
                );
                batch.remove(id);
                run.report.reconciled += 1;
            }
        }
        Ok(())
    }
}
