//! Local event store: records per calendar plus start/end indices.
//!
//! All mutation goes through [`EventStore::apply`], which commits a
//! [`WriteBatch`] atomically. A failed apply leaves both the records and
//! the indices exactly as they were, so a sync run can stop at any page
//! boundary without leaving a half-applied page behind.
//!
//! Reads go through [`EventStore::view`]: an immutable [`CalendarIndex`]
//! as of the last committed batch. A reader that needs several lookups
//! takes one view and asks it everything.

mod index;
mod local;

pub use index::CalendarIndex;
pub use local::LocalStore;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::event::{Calendar, EventId, EventRecord};

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Upsert(EventRecord),
    /// Removing an absent id is a no-op. Removing a master removes its
    /// exceptions too.
    Remove(EventId),
    SetSyncToken {
        token: String,
        synced_at: DateTime<Utc>,
    },
    ClearSyncToken,
    SetTimeZone(String),
}

/// An ordered list of mutations committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: EventRecord) -> &mut Self {
        self.ops.push(WriteOp::Upsert(record));
        self
    }

    pub fn remove(&mut self, id: impl Into<EventId>) -> &mut Self {
        self.ops.push(WriteOp::Remove(id.into()));
        self
    }

    pub fn set_sync_token(
        &mut self,
        token: impl Into<String>,
        synced_at: DateTime<Utc>,
    ) -> &mut Self {
        self.ops.push(WriteOp::SetSyncToken {
            token: token.into(),
            synced_at,
        });
        self
    }

    pub fn clear_sync_token(&mut self) -> &mut Self {
        self.ops.push(WriteOp::ClearSyncToken);
        self
    }

    pub fn set_time_zone(&mut self, tz: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::SetTimeZone(tz.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Durable, indexed storage of event records, partitioned by calendar.
///
/// Reads never observe a partially applied batch.
pub trait EventStore: Send + Sync {
    /// Add a calendar. Registering a known calendar keeps its records and
    /// only refreshes the summary.
    fn register_calendar(&self, calendar: Calendar) -> StoreResult<()>;

    fn calendars(&self) -> StoreResult<Vec<Calendar>>;

    /// Commit every op in `batch` or none of them.
    fn apply(&self, calendar_id: &str, batch: WriteBatch) -> StoreResult<()>;

    /// The calendar as of the last committed batch. Later commits do not
    /// change a view already handed out.
    fn view(&self, calendar_id: &str) -> StoreResult<Arc<CalendarIndex>>;

    fn calendar(&self, calendar_id: &str) -> StoreResult<Calendar> {
        Ok(self.view(calendar_id)?.calendar().clone())
    }

    fn get_by_id(&self, calendar_id: &str, id: &str) -> StoreResult<Option<EventRecord>> {
        Ok(self.view(calendar_id)?.get(id).cloned())
    }

    fn event_ids(&self, calendar_id: &str) -> StoreResult<Vec<EventId>> {
        Ok(self.view(calendar_id)?.event_ids().cloned().collect())
    }

    /// Non-cancelled records with start in `[from, to)`, by (start, id).
    fn range_by_start(
        &self,
        calendar_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EventRecord>> {
        Ok(self.view(calendar_id)?.range_by_start(from, to))
    }

    /// Non-cancelled records with end in `[from, to)`, by (end, id).
    fn range_by_end(
        &self,
        calendar_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EventRecord>> {
        Ok(self.view(calendar_id)?.range_by_end(from, to))
    }

    /// Non-cancelled records overlapping `[from, to)`, by (start, id).
    fn overlapping(
        &self,
        calendar_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EventRecord>> {
        Ok(self.view(calendar_id)?.overlapping(from, to))
    }

    /// Earliest non-master record starting at or after `instant`.
    fn next_after(
        &self,
        calendar_id: &str,
        instant: DateTime<Utc>,
    ) -> StoreResult<Option<EventRecord>> {
        Ok(self.view(calendar_id)?.next_after(instant))
    }

    /// Exceptions of `master_id`, cancelled ones included.
    fn exceptions_of(&self, calendar_id: &str, master_id: &str) -> StoreResult<Vec<EventRecord>> {
        Ok(self.view(calendar_id)?.exceptions_of(master_id))
    }

    fn upsert(&self, calendar_id: &str, record: EventRecord) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.upsert(record);
        self.apply(calendar_id, batch)
    }

    fn remove(&self, calendar_id: &str, id: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.remove(id);
        self.apply(calendar_id, batch)
    }

    fn sync_token(&self, calendar_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .calendar(calendar_id)?
            .usable_sync_token()
            .map(String::from))
    }

    fn set_sync_token(&self, calendar_id: &str, token: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.set_sync_token(token, Utc::now());
        self.apply(calendar_id, batch)
    }
}
