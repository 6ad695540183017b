//! Calendar and event records held by the local replica.
//!
//! Raw remote records are resolved into these types once, at ingestion
//! (see [`crate::raw`]). Everything downstream works exclusively with them.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::constants::STORE_VERSION;

pub type CalendarId = String;
pub type EventId = String;

/// A calendar registered with the replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: CalendarId,
    pub summary: Option<String>,
    /// IANA zone reported by the remote source, if any. All-day dates of
    /// this calendar start at midnight in this zone.
    pub time_zone: Option<String>,
    /// `None` until a full sync has completed.
    pub sync_token: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub store_version: u32,
}

impl Calendar {
    pub fn new(id: impl Into<CalendarId>) -> Self {
        Calendar {
            id: id.into(),
            summary: None,
            time_zone: None,
            sync_token: None,
            last_synced: None,
            store_version: STORE_VERSION,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Zone all-day dates are read in: the reported zone, else UTC.
    pub fn zone(&self) -> Tz {
        self.time_zone
            .as_deref()
            .and_then(|tz| tz.parse().ok())
            .unwrap_or(Tz::UTC)
    }

    /// The sync token to present on the next run.
    ///
    /// Tokens written by an older store version are ignored so that the next
    /// run reconciles from scratch.
    pub fn usable_sync_token(&self) -> Option<&str> {
        if self.store_version < STORE_VERSION {
            return None;
        }
        self.sync_token.as_deref()
    }
}

/// Start or end of an event: an instant, or a calendar date for all-day events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTime {
    DateTime(DateTime<Utc>),
    /// All-day. End dates are exclusive.
    Date(NaiveDate),
}

impl EventTime {
    /// Zone-independent key. Dates map to midnight UTC.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            EventTime::DateTime(dt) => *dt,
            EventTime::Date(d) => d.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    /// The instant this time stands for when dates are read in `zone`.
    pub fn instant_in(&self, zone: Tz) -> DateTime<Utc> {
        match self {
            EventTime::DateTime(dt) => *dt,
            EventTime::Date(d) => local_midnight(*d, zone),
        }
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }

    /// Shift by `offset`, keeping the variant. Dates move by whole days.
    pub fn shifted(&self, offset: Duration) -> EventTime {
        match self {
            EventTime::DateTime(dt) => EventTime::DateTime(*dt + offset),
            EventTime::Date(d) => EventTime::Date(*d + Duration::days(offset.num_days())),
        }
    }
}

/// Start of `date` in `zone`. When a DST gap swallows midnight, the first
/// whole hour after it.
fn local_midnight(date: NaiveDate, zone: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    (0..=24)
        .find_map(|hour| {
            zone.from_local_datetime(&(midnight + Duration::hours(hour)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

/// Whether `[start, end)` overlaps the half-open window `[from, to)`.
/// A zero-length span counts as the point `start`.
pub fn spans_overlap(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> bool {
    start < to && (end > from || start >= from)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Confirmed,
    Cancelled,
}

/// Opaque RRULE/EXRULE/RDATE/EXDATE lines exactly as the remote sent them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule(pub Vec<String>);

impl RecurrenceRule {
    pub fn lines(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Single,
    RecurringMaster {
        rule: RecurrenceRule,
    },
    /// Replaces (or cancels) the master's occurrence at `original_start`.
    RecurringException {
        master_id: EventId,
        original_start: EventTime,
    },
}

/// One stored event, addressed by its id within a calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub status: EventStatus,
    pub start: EventTime,
    pub end: EventTime,
    /// IANA zone of a timed start; recurrences expand in this zone.
    pub time_zone: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub ical_uid: Option<String>,
    pub updated: Option<DateTime<Utc>>,
}

impl EventRecord {
    pub fn start_in(&self, zone: Tz) -> DateTime<Utc> {
        self.start.instant_in(zone)
    }

    pub fn end_in(&self, zone: Tz) -> DateTime<Utc> {
        self.end.instant_in(zone)
    }

    /// Length of the event. All-day events last whole days in any zone.
    pub fn duration(&self) -> Duration {
        self.end.to_utc() - self.start.to_utc()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    pub fn is_master(&self) -> bool {
        matches!(self.kind, EventKind::RecurringMaster { .. })
    }

    /// The master this record overrides an occurrence of, if it is an exception.
    pub fn master_id(&self) -> Option<&EventId> {
        match &self.kind {
            EventKind::RecurringException { master_id, .. } => Some(master_id),
            _ => None,
        }
    }

    pub fn original_start(&self) -> Option<&EventTime> {
        match &self.kind {
            EventKind::RecurringException { original_start, .. } => Some(original_start),
            _ => None,
        }
    }

    /// Whether this record overlaps the half-open window `[from, to)`.
    pub fn overlaps(&self, zone: Tz, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        spans_overlap(self.start_in(zone), self.end_in(zone), from, to)
    }
}
