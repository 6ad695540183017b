//! Raw event records as delivered by the remote source, and their decoder.
//!
//! The wire shape mirrors the Google Calendar `events.list` payload. Each
//! record is resolved once into a closed [`Ingested`] action; nothing
//! downstream looks at the raw fields again.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, SyncError};
use crate::event::{EventId, EventKind, EventRecord, EventStatus, EventTime, RecurrenceRule};

/// `start`, `end` or `originalStartTime` of a raw record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTime {
    pub date_time: Option<DateTime<Utc>>,
    pub date: Option<NaiveDate>,
    pub time_zone: Option<String>,
}

impl RawTime {
    fn to_event_time(&self) -> Option<EventTime> {
        if let Some(dt) = self.date_time {
            Some(EventTime::DateTime(dt))
        } else {
            self.date.map(EventTime::Date)
        }
    }
}

/// A raw event record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    #[serde(rename = "iCalUID")]
    pub ical_uid: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub start: Option<RawTime>,
    pub end: Option<RawTime>,
    #[serde(default)]
    pub recurrence: Vec<String>,
    pub recurring_event_id: Option<String>,
    pub original_start_time: Option<RawTime>,
}

/// One page of changes.
///
/// Exactly one of `next_page_token` / `next_sync_token` is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPage {
    #[serde(default)]
    pub items: Vec<RawEvent>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
    pub time_zone: Option<String>,
}

/// How a page ends: more pages follow, or the run is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEnd {
    NextPage(String),
    Complete { sync_token: String },
}

impl RawPage {
    pub fn end(&self) -> Result<PageEnd, SyncError> {
        match (&self.next_page_token, &self.next_sync_token) {
            (Some(page), None) => Ok(PageEnd::NextPage(page.clone())),
            (None, Some(sync)) => Ok(PageEnd::Complete {
                sync_token: sync.clone(),
            }),
            (None, None) => Err(SyncError::TransportFailure(
                "page carried neither a page token nor a sync token".into(),
            )),
            (Some(_), Some(_)) => Err(SyncError::TransportFailure(
                "page carried both a page token and a sync token".into(),
            )),
        }
    }
}

/// What to do with one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Upsert(EventRecord),
    Delete(EventId),
}

impl RawEvent {
    fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    /// Resolve the record into a store action.
    ///
    /// Cancelled singles and masters become deletions. A cancelled exception
    /// is kept as a cancellation override; the remote may omit its
    /// start/end, in which case the original start stands in for both.
    pub fn ingest(self) -> Result<Ingested, DecodeError> {
        if self.id.is_empty() {
            return Err(DecodeError::MissingId);
        }

        let cancelled = self.is_cancelled();
        let original_start = self
            .original_start_time
            .as_ref()
            .and_then(RawTime::to_event_time);

        let kind = if let Some(master_id) = self.recurring_event_id.clone() {
            let original_start =
                original_start.ok_or_else(|| DecodeError::MissingOriginalStart(self.id.clone()))?;
            EventKind::RecurringException {
                master_id,
                original_start,
            }
        } else if cancelled {
            return Ok(Ingested::Delete(self.id));
        } else if !self.recurrence.is_empty() {
            EventKind::RecurringMaster {
                rule: RecurrenceRule(self.recurrence.clone()),
            }
        } else {
            EventKind::Single
        };

        let tombstone_time = match &kind {
            EventKind::RecurringException { original_start, .. } if cancelled => {
                Some(*original_start)
            }
            _ => None,
        };

        let start = self
            .start
            .as_ref()
            .and_then(RawTime::to_event_time)
            .or(tombstone_time)
            .ok_or_else(|| DecodeError::MissingStart(self.id.clone()))?;
        let end = self
            .end
            .as_ref()
            .and_then(RawTime::to_event_time)
            .or(tombstone_time)
            .ok_or_else(|| DecodeError::MissingEnd(self.id.clone()))?;

        if start.is_all_day() != end.is_all_day() {
            return Err(DecodeError::MixedBoundaries(self.id));
        }
        if end.to_utc() < start.to_utc() {
            return Err(DecodeError::EndBeforeStart(self.id));
        }

        let time_zone = self.start.as_ref().and_then(|s| s.time_zone.clone());
        if let Some(tz) = &time_zone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(DecodeError::UnknownTimeZone {
                    id: self.id,
                    tz: tz.clone(),
                });
            }
        }

        Ok(Ingested::Upsert(EventRecord {
            id: self.id,
            kind,
            status: if cancelled {
                EventStatus::Cancelled
            } else {
                EventStatus::Confirmed
            },
            start,
            end,
            time_zone,
            summary: self.summary,
            description: self.description,
            location: self.location,
            ical_uid: self.ical_uid,
            updated: self.updated,
        }))
    }
}
