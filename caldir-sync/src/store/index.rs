//! In-memory record table with start/end secondary indices for one calendar.
//!
//! The indices are a projection of the record table: every non-cancelled
//! record has exactly one `(instant, id)` entry in each, cancelled records
//! have none. All-day dates are keyed at midnight in the calendar's zone, so
//! a zone change re-keys them. Exceptions are additionally grouped by master
//! so a timeline can look up the override for a given original instant.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::event::{Calendar, EventId, EventRecord, spans_overlap};
use crate::store::WriteOp;

type IndexKey = (DateTime<Utc>, EventId);

#[derive(Debug, Clone)]
pub struct CalendarIndex {
    pub(crate) calendar: Calendar,
    zone: Tz,
    records: HashMap<EventId, EventRecord>,
    by_start: BTreeSet<IndexKey>,
    by_end: BTreeSet<IndexKey>,
    /// master id -> original start -> exception id
    exceptions: HashMap<EventId, BTreeMap<DateTime<Utc>, EventId>>,
}

impl CalendarIndex {
    pub fn new(calendar: Calendar) -> Self {
        CalendarIndex {
            zone: calendar.zone(),
            calendar,
            records: HashMap::new(),
            by_start: BTreeSet::new(),
            by_end: BTreeSet::new(),
            exceptions: HashMap::new(),
        }
    }

    /// Rebuild indices from a list of records (snapshot load).
    pub fn from_records(calendar: Calendar, records: Vec<EventRecord>) -> Self {
        let mut index = CalendarIndex::new(calendar);
        for record in records {
            index.upsert(record);
        }
        index
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Zone all-day records are keyed in.
    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.values()
    }

    pub fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Upsert(record) => self.upsert(record),
            WriteOp::Remove(id) => self.remove(&id),
            WriteOp::SetSyncToken { token, synced_at } => {
                self.calendar.sync_token = Some(token);
                self.calendar.last_synced = Some(synced_at);
                self.calendar.store_version = crate::constants::STORE_VERSION;
            }
            WriteOp::ClearSyncToken => {
                self.calendar.sync_token = None;
            }
            WriteOp::SetTimeZone(tz) => {
                self.calendar.time_zone = Some(tz);
                if self.calendar.zone() != self.zone {
                    self.rezone();
                }
            }
        }
    }

    /// Rebuild the indices after the calendar zone changed.
    fn rezone(&mut self) {
        self.zone = self.calendar.zone();
        self.by_start.clear();
        self.by_end.clear();
        for record in self.records.values().filter(|r| !r.is_cancelled()) {
            self.by_start
                .insert((record.start_in(self.zone), record.id.clone()));
            self.by_end.insert((record.end_in(self.zone), record.id.clone()));
        }
    }

    /// Insert or replace a record, moving its index entries.
    pub fn upsert(&mut self, record: EventRecord) {
        self.unlink(&record.id);

        if !record.is_cancelled() {
            self.by_start
                .insert((record.start_in(self.zone), record.id.clone()));
            self.by_end.insert((record.end_in(self.zone), record.id.clone()));
        }
        if let (Some(master_id), Some(original)) = (record.master_id(), record.original_start()) {
            self.exceptions
                .entry(master_id.clone())
                .or_default()
                .insert(original.to_utc(), record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    /// Remove a record. Removing a master also removes its exceptions.
    pub fn remove(&mut self, id: &str) {
        let Some(removed) = self.unlink(id) else {
            return;
        };
        if removed.is_master() {
            let exception_ids: Vec<EventId> = self
                .exceptions
                .remove(id)
                .map(|m| m.into_values().collect())
                .unwrap_or_default();
            for exception_id in exception_ids {
                self.unlink(&exception_id);
            }
        }
    }

    /// Drop a record and every derived entry pointing at it.
    fn unlink(&mut self, id: &str) -> Option<EventRecord> {
        let old = self.records.remove(id)?;
        if !old.is_cancelled() {
            self.by_start.remove(&(old.start_in(self.zone), old.id.clone()));
            self.by_end.remove(&(old.end_in(self.zone), old.id.clone()));
        }
        if let (Some(master_id), Some(original)) = (old.master_id(), old.original_start()) {
            if let Some(by_original) = self.exceptions.get_mut(master_id) {
                let key = original.to_utc();
                if by_original.get(&key).is_some_and(|e| e == id) {
                    by_original.remove(&key);
                }
                if by_original.is_empty() {
                    self.exceptions.remove(master_id);
                }
            }
        }
        Some(old)
    }

    pub fn get(&self, id: &str) -> Option<&EventRecord> {
        self.records.get(id)
    }

    pub fn event_ids(&self) -> impl Iterator<Item = &EventId> {
        self.records.keys()
    }

    fn resolve<'a>(&'a self, keys: impl Iterator<Item = &'a IndexKey>) -> Vec<EventRecord> {
        keys.filter_map(|(_, id)| self.records.get(id).cloned())
            .collect()
    }

    /// Records starting in `[from, to)`, ordered by start then id.
    pub fn range_by_start(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<EventRecord> {
        if from >= to {
            return Vec::new();
        }
        self.resolve(self.by_start.range(range_from(from, to)))
    }

    /// Records ending in `[from, to)`, ordered by end then id.
    pub fn range_by_end(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<EventRecord> {
        if from >= to {
            return Vec::new();
        }
        self.resolve(self.by_end.range(range_from(from, to)))
    }

    /// Records overlapping `[from, to)`: start < to and end > from, or a
    /// zero-length record starting at `from`.
    ///
    /// Walks the end index from `from`, so history before the window is
    /// never touched.
    pub fn overlapping(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<EventRecord> {
        if from >= to {
            return Vec::new();
        }
        let zone = self.zone;
        let mut hits: Vec<EventRecord> = self
            .by_end
            .range((Bound::Included((from, String::new())), Bound::Unbounded))
            .filter_map(|(_, id)| self.records.get(id))
            .filter(|r| spans_overlap(r.start_in(zone), r.end_in(zone), from, to))
            .cloned()
            .collect();
        hits.sort_by(|a, b| (a.start_in(zone), &a.id).cmp(&(b.start_in(zone), &b.id)));
        hits
    }

    /// First non-cancelled record starting at or after `instant`.
    pub fn next_after(&self, instant: DateTime<Utc>) -> Option<EventRecord> {
        self.by_start
            .range((Bound::Included((instant, String::new())), Bound::Unbounded))
            .find_map(|(_, id)| self.records.get(id).filter(|r| !r.is_master()))
            .cloned()
    }

    /// Non-cancelled masters whose first occurrence starts before `to`.
    pub fn masters_starting_before(&self, to: DateTime<Utc>) -> Vec<EventRecord> {
        self.by_start
            .range(..(to, String::new()))
            .filter_map(|(_, id)| self.records.get(id))
            .filter(|r| r.is_master())
            .cloned()
            .collect()
    }

    pub fn has_masters(&self) -> bool {
        self.records
            .values()
            .any(|r| r.is_master() && !r.is_cancelled())
    }

    /// Exceptions stored for `master_id`, keyed by the instant they override.
    pub fn exceptions_of(&self, master_id: &str) -> Vec<EventRecord> {
        self.exceptions
            .get(master_id)
            .map(|by_original| {
                by_original
                    .values()
                    .filter_map(|id| self.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn index_counts(&self, id: &str) -> (usize, usize) {
        (
            self.by_start.iter().filter(|(_, e)| e == id).count(),
            self.by_end.iter().filter(|(_, e)| e == id).count(),
        )
    }
}

fn range_from(from: DateTime<Utc>, to: DateTime<Utc>) -> (Bound<IndexKey>, Bound<IndexKey>) {
    (
        Bound::Included((from, String::new())),
        Bound::Excluded((to, String::new())),
    )
}
