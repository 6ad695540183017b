#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use caldir_sync::raw::Ingested;
use caldir_sync::store::CalendarIndex;
use caldir_sync::{
    Calendar, CalendarReplica, EventRecord, EventStore, LocalStore, PageRequest, RawEvent,
    RawEventSource, RawPage, SourceError, StoreError, StoreResult, SyncConfig, WriteBatch,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

pub const CALENDAR: &str = "work";

/// What the scripted source does on one fetch.
pub enum Step {
    Page(RawPage),
    Fail(SourceError),
    /// Answer after the delay (use with paused time).
    Delayed(Duration, RawPage),
    /// Never answer.
    Stall,
}

/// A raw event source that replays a script, one step per fetch.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(ScriptedSource {
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RawEventSource for ScriptedSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage, SourceError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Page(page)) => Ok(page),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Delayed(delay, page)) => {
                tokio::time::sleep(delay).await;
                Ok(page)
            }
            Some(Step::Stall) => std::future::pending().await,
            None => Err(SourceError::Transport("script exhausted".into())),
        }
    }
}

/// A store whose `apply` fails on chosen calls (1-based).
pub struct FlakyStore {
    inner: LocalStore,
    applies: AtomicUsize,
    fail_on: Mutex<Vec<usize>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        let inner = LocalStore::in_memory();
        inner.register_calendar(Calendar::new(CALENDAR)).unwrap();
        Arc::new(FlakyStore {
            inner,
            applies: AtomicUsize::new(0),
            fail_on: Mutex::new(Vec::new()),
        })
    }

    /// Fail the `n`-th apply from now on.
    pub fn fail_apply_after(&self, n: usize) {
        let at = self.applies.load(Ordering::SeqCst) + n;
        self.fail_on.lock().unwrap().push(at);
    }
}

impl EventStore for FlakyStore {
    fn register_calendar(&self, calendar: Calendar) -> StoreResult<()> {
        self.inner.register_calendar(calendar)
    }

    fn calendars(&self) -> StoreResult<Vec<Calendar>> {
        self.inner.calendars()
    }

    fn apply(&self, calendar_id: &str, batch: WriteBatch) -> StoreResult<()> {
        let call = self.applies.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.lock().unwrap().contains(&call) {
            return Err(StoreError::Unavailable("disk detached".into()));
        }
        self.inner.apply(calendar_id, batch)
    }

    fn view(&self, calendar_id: &str) -> StoreResult<Arc<CalendarIndex>> {
        self.inner.view(calendar_id)
    }
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn timed(id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "status": "confirmed",
        "summary": id,
        "start": {"dateTime": rfc3339(start)},
        "end": {"dateTime": rfc3339(end)},
    })
}

pub fn recurring(id: &str, start: DateTime<Utc>, end: DateTime<Utc>, rrule: &str) -> Value {
    let mut event = timed(id, start, end);
    event["recurrence"] = json!([format!("RRULE:{rrule}")]);
    event
}

pub fn exception(
    id: &str,
    master_id: &str,
    original: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Value {
    let mut event = timed(id, start, end);
    event["recurringEventId"] = json!(master_id);
    event["originalStartTime"] = json!({"dateTime": rfc3339(original)});
    event
}

pub fn cancelled(id: &str) -> Value {
    json!({"id": id, "status": "cancelled"})
}

pub fn cancelled_exception(id: &str, master_id: &str, original: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "status": "cancelled",
        "recurringEventId": master_id,
        "originalStartTime": {"dateTime": rfc3339(original)},
    })
}

/// Decode a raw event the way the engine does.
pub fn record(value: Value) -> EventRecord {
    let raw: RawEvent = serde_json::from_value(value).unwrap();
    match raw.ingest().unwrap() {
        Ingested::Upsert(record) => record,
        other => panic!("expected an upsert, got {other:?}"),
    }
}

pub fn page(
    items: Vec<Value>,
    next_page_token: Option<&str>,
    next_sync_token: Option<&str>,
) -> RawPage {
    RawPage {
        items: items
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect(),
        next_page_token: next_page_token.map(String::from),
        next_sync_token: next_sync_token.map(String::from),
        time_zone: None,
    }
}

pub fn more(items: Vec<Value>, page_token: &str) -> Step {
    Step::Page(page(items, Some(page_token), None))
}

pub fn last(items: Vec<Value>, sync_token: &str) -> Step {
    Step::Page(page(items, None, Some(sync_token)))
}

/// A replica over an in-memory store with the work calendar registered.
pub fn replica(source: Arc<ScriptedSource>) -> (CalendarReplica, Arc<LocalStore>) {
    let store = Arc::new(LocalStore::in_memory());
    let replica = CalendarReplica::new(source, store.clone(), SyncConfig::default());
    replica.register(Calendar::new(CALENDAR)).unwrap();
    (replica, store)
}

/// Every stored record, sorted by id, for whole-store comparisons.
pub fn snapshot(store: &dyn EventStore) -> Vec<EventRecord> {
    let mut ids = store.event_ids(CALENDAR).unwrap();
    ids.sort();
    ids.iter()
        .map(|id| store.get_by_id(CALENDAR, id).unwrap().unwrap())
        .collect()
}
