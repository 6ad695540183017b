//! Read-side queries: concrete occurrences of stored events.
//!
//! A [`Timeline`] is a query, not a result. Every call to [`Timeline::iter`]
//! takes a fresh store view and merges the per-source occurrence streams, so
//! iterating twice over an unchanged store yields the same sequence. One
//! evaluation reads a single view, so a page committed meanwhile is either
//! wholly visible or not at all.
//!
//! All-day occurrences start at midnight in the calendar's zone.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::config::TimelineConfig;
use crate::error::StoreResult;
use crate::event::{CalendarId, EventId, EventKind, EventRecord, EventTime, spans_overlap};
use crate::recurrence;
use crate::store::{CalendarIndex, EventStore};

/// A concrete, dated instance of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Occurrence {
    /// The record id, or a synthetic `<master>_<instant>` id for generated
    /// occurrences.
    pub id: EventId,
    /// Set for generated occurrences and for exceptions.
    pub recurring_event_id: Option<EventId>,
    /// The series instant this occurrence stands for, if it belongs to one.
    pub original_start: Option<EventTime>,
    pub start: EventTime,
    pub end: EventTime,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub time_zone: Option<String>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
}

impl Occurrence {
    fn from_record(record: &EventRecord, zone: Tz) -> Self {
        Occurrence {
            id: record.id.clone(),
            recurring_event_id: record.master_id().cloned(),
            original_start: record.original_start().copied(),
            start: record.start,
            end: record.end,
            summary: record.summary.clone(),
            description: record.description.clone(),
            location: record.location.clone(),
            time_zone: record.time_zone.clone(),
            start_at: record.start_in(zone),
            end_at: record.end_in(zone),
        }
    }

    fn generated(master: &EventRecord, start: EventTime, zone: Tz) -> Self {
        let end = start.shifted(master.duration());
        Occurrence {
            id: recurrence::occurrence_id(&master.id, &start),
            recurring_event_id: Some(master.id.clone()),
            original_start: Some(start),
            start,
            end,
            summary: master.summary.clone(),
            description: master.description.clone(),
            location: master.location.clone(),
            time_zone: master.time_zone.clone(),
            start_at: start.instant_in(zone),
            end_at: end.instant_in(zone),
        }
    }

    pub fn start_instant(&self) -> DateTime<Utc> {
        self.start_at
    }

    pub fn end_instant(&self) -> DateTime<Utc> {
        self.end_at
    }

    pub fn is_all_day(&self) -> bool {
        self.start.is_all_day()
    }

    fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        spans_overlap(self.start_at, self.end_at, from, to)
    }

    fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.start_instant(), self.id.as_str())
    }
}

/// Heap entry: the head of one source stream.
struct Head {
    occurrence: Occurrence,
    source: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.occurrence
            .sort_key()
            .cmp(&other.occurrence.sort_key())
            .then(self.source.cmp(&other.source))
    }
}

/// Iterator over one evaluation of a [`Timeline`]: a k-way merge of sorted
/// sources, ordered by (start, id), each id yielded once.
pub struct Occurrences {
    sources: Vec<std::vec::IntoIter<Occurrence>>,
    heap: BinaryHeap<Reverse<Head>>,
    seen: HashSet<EventId>,
}

impl Occurrences {
    fn merge(sources: Vec<Vec<Occurrence>>) -> Self {
        let mut sources: Vec<_> = sources.into_iter().map(Vec::into_iter).collect();
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(occurrence) = iter.next() {
                heap.push(Reverse(Head { occurrence, source }));
            }
        }
        Occurrences {
            sources,
            heap,
            seen: HashSet::new(),
        }
    }
}

impl Iterator for Occurrences {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        while let Some(Reverse(Head { occurrence, source })) = self.heap.pop() {
            if let Some(next) = self.sources[source].next() {
                self.heap.push(Reverse(Head {
                    occurrence: next,
                    source,
                }));
            }
            if self.seen.insert(occurrence.id.clone()) {
                return Some(occurrence);
            }
        }
        None
    }
}

/// Occurrences of one calendar overlapping `[from, to)`.
#[derive(Clone)]
pub struct Timeline {
    builder: TimelineBuilder,
    calendar_id: CalendarId,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("calendar_id", &self.calendar_id)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl Timeline {
    pub fn calendar_id(&self) -> &str {
        &self.calendar_id
    }

    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.from, self.to)
    }

    /// Evaluate the query against the store as it is now.
    pub fn iter(&self) -> StoreResult<Occurrences> {
        let view = self.builder.store.view(&self.calendar_id)?;
        Ok(Occurrences::merge(self.builder.sources(&view, self.from, self.to)))
    }

    pub fn to_vec(&self) -> StoreResult<Vec<Occurrence>> {
        Ok(self.iter()?.collect())
    }
}

/// Builds timeline queries over an [`EventStore`]. Holds no per-query state.
#[derive(Clone)]
pub struct TimelineBuilder {
    store: Arc<dyn EventStore>,
    config: TimelineConfig,
}

impl TimelineBuilder {
    pub fn new(store: Arc<dyn EventStore>, config: TimelineConfig) -> Self {
        TimelineBuilder { store, config }
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// All occurrences overlapping `[from, to)`, ordered by start then id.
    ///
    /// Fails only if the calendar is unknown or the store is unreadable.
    pub fn occurrences_in_range(
        &self,
        calendar_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Timeline> {
        self.store.calendar(calendar_id)?;
        Ok(Timeline {
            builder: self.clone(),
            calendar_id: calendar_id.to_string(),
            from,
            to,
        })
    }

    /// The first occurrence starting at or after `at`.
    ///
    /// Searches a window that starts at `initial_lookahead` and doubles up
    /// to `max_lookahead`, so open-ended series never expand unboundedly.
    pub fn next_occurrence(
        &self,
        calendar_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Occurrence>> {
        let view = self.store.view(calendar_id)?;
        let stored = view
            .next_after(at)
            .map(|r| Occurrence::from_record(&r, view.zone()));
        if !view.has_masters() {
            return Ok(stored);
        }

        for span in self.lookahead_spans() {
            let to = window_end(at, span);
            let found = Occurrences::merge(self.sources(&view, at, to))
                .find(|o| o.start_instant() >= at);

            let best = match (found, &stored) {
                (Some(found), Some(stored)) if stored.sort_key() < found.sort_key() => {
                    Some(stored.clone())
                }
                (Some(found), _) => Some(found),
                (None, Some(stored)) if stored.start_instant() < to => Some(stored.clone()),
                (None, _) => None,
            };
            if best.is_some() {
                return Ok(best);
            }
        }

        tracing::debug!(
            calendar = calendar_id,
            %at,
            "no occurrence within the maximum lookahead"
        );
        Ok(stored)
    }

    /// Occurrences in progress at `at` or starting after it, within the first
    /// lookahead window that contains any.
    pub fn active_after(&self, calendar_id: &str, at: DateTime<Utc>) -> StoreResult<Timeline> {
        let mut last = None;
        for span in self.lookahead_spans() {
            let timeline = self.occurrences_in_range(calendar_id, at, window_end(at, span))?;
            if timeline.iter()?.next().is_some() {
                return Ok(timeline);
            }
            last = Some(timeline);
        }
        match last {
            Some(timeline) => Ok(timeline),
            None => self.occurrences_in_range(calendar_id, at, at),
        }
    }

    /// Doubling search spans, ending exactly at `max_lookahead`.
    fn lookahead_spans(&self) -> Vec<Duration> {
        let max = Duration::from_std(self.config.max_lookahead).unwrap_or(Duration::MAX);
        let mut span = Duration::from_std(self.config.initial_lookahead)
            .unwrap_or(Duration::days(1))
            .min(max);
        let mut spans = vec![span];
        while span < max {
            span = span.checked_mul(2).unwrap_or(max).min(max);
            spans.push(span);
        }
        spans
    }

    /// Sorted occurrence streams for `[from, to)`, all read from one view.
    ///
    /// Stored non-master records (singles, exceptions, orphans) come from
    /// the overlap scan. Each master contributes one stream of generated
    /// occurrences, skipping instants that any exception overrides; a live
    /// override shows up through the overlap scan wherever it was moved.
    fn sources(
        &self,
        view: &CalendarIndex,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Vec<Occurrence>> {
        if from >= to {
            return Vec::new();
        }
        let zone = view.zone();

        let stored: Vec<Occurrence> = view
            .overlapping(from, to)
            .iter()
            .filter(|r| !r.is_master())
            .map(|r| Occurrence::from_record(r, zone))
            .collect();
        let mut sources = vec![stored];

        for master in view.masters_starting_before(to) {
            let overridden: HashSet<DateTime<Utc>> = view
                .exceptions_of(&master.id)
                .iter()
                .filter_map(|e| e.original_start().map(EventTime::to_utc))
                .collect();
            sources.push(self.expand(&master, zone, from, to, &overridden));
        }

        sources
    }

    fn expand(
        &self,
        master: &EventRecord,
        zone: Tz,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        overridden: &HashSet<DateTime<Utc>>,
    ) -> Vec<Occurrence> {
        debug_assert!(matches!(master.kind, EventKind::RecurringMaster { .. }));

        // Occurrences starting up to one duration before the window can still overlap it.
        let expand_from = from
            .checked_sub_signed(master.duration())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let starts = match recurrence::expand_starts(
            master,
            zone,
            expand_from,
            to,
            self.config.max_occurrences_per_master,
        ) {
            Ok(starts) => starts,
            Err(e) => {
                tracing::warn!(
                    event_id = %master.id,
                    error = %e,
                    "skipping unexpandable recurrence"
                );
                return Vec::new();
            }
        };

        starts
            .into_iter()
            .filter(|start| !overridden.contains(&start.to_utc()))
            .map(|start| Occurrence::generated(master, start, zone))
            .filter(|o| o.overlaps(from, to))
            .collect()
    }
}

/// `at + span`, saturating at the latest representable instant.
fn window_end(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    at.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
