//! [`EventStore`] backed by memory, optionally snapshotted to a directory.
//!
//! With a directory, each calendar is kept as one JSON snapshot
//! (`<slug>-<hash>.json`) holding the calendar state and every record. A
//! batch is applied to a copy of the calendar's index, the copy is written
//! to disk via temp file + rename, and only then swapped in. Views handed
//! out before the swap keep the old index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};
use crate::event::{Calendar, CalendarId, EventRecord};
use crate::store::{CalendarIndex, EventStore, WriteBatch};

const SNAPSHOT_EXTENSION: &str = "json";

/// Hex digits of the id hash in a snapshot file name.
const SNAPSHOT_HASH_LEN: usize = 16;

type Calendars = HashMap<CalendarId, Arc<CalendarIndex>>;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    calendar: Calendar,
    #[serde(default)]
    events: Vec<EventRecord>,
}

pub struct LocalStore {
    dir: Option<PathBuf>,
    calendars: RwLock<Calendars>,
}

impl LocalStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        LocalStore {
            dir: None,
            calendars: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a store under `dir`, loading existing snapshots.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut calendars = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            tracing::debug!(
                calendar = %snapshot.calendar.id,
                events = snapshot.events.len(),
                "loaded calendar snapshot"
            );
            let index = CalendarIndex::from_records(snapshot.calendar, snapshot.events);
            calendars.insert(index.calendar().id.clone(), Arc::new(index));
        }

        Ok(LocalStore {
            dir: Some(dir),
            calendars: RwLock::new(calendars),
        })
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Calendars>> {
        self.calendars
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Calendars>> {
        self.calendars
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    /// Readable slug plus a hash of the raw id, so ids that slugify alike
    /// (`Team.Cal`, `team-cal`) get their own files.
    fn snapshot_path(dir: &Path, calendar_id: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(calendar_id.as_bytes()));
        dir.join(format!(
            "{}-{}.{SNAPSHOT_EXTENSION}",
            slug::slugify(calendar_id),
            &digest[..SNAPSHOT_HASH_LEN]
        ))
    }

    /// Write the calendar snapshot (atomic write via temp file + rename).
    fn persist(&self, index: &CalendarIndex) -> StoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let mut events: Vec<EventRecord> = index.records().cloned().collect();
        // Sort for deterministic output
        events.sort_by(|a, b| a.id.cmp(&b.id));
        let snapshot = Snapshot {
            calendar: index.calendar().clone(),
            events,
        };
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let path = Self::snapshot_path(dir, &index.calendar().id);
        let temp = path.with_extension(format!("{SNAPSHOT_EXTENSION}.tmp"));
        std::fs::write(&temp, content)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", temp.display())))?;
        std::fs::rename(&temp, &path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

impl EventStore for LocalStore {
    fn register_calendar(&self, calendar: Calendar) -> StoreResult<()> {
        let mut calendars = self.write()?;
        let updated = match calendars.get(&calendar.id) {
            Some(existing) => {
                let mut index = CalendarIndex::clone(existing);
                if calendar.summary.is_some() {
                    index.calendar.summary = calendar.summary;
                }
                index
            }
            None => CalendarIndex::new(calendar),
        };
        self.persist(&updated)?;
        tracing::debug!(calendar = %updated.calendar().id, "registered calendar");
        calendars.insert(updated.calendar().id.clone(), Arc::new(updated));
        Ok(())
    }

    fn calendars(&self) -> StoreResult<Vec<Calendar>> {
        let mut calendars: Vec<Calendar> =
            self.read()?.values().map(|i| i.calendar().clone()).collect();
        calendars.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(calendars)
    }

    fn apply(&self, calendar_id: &str, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut calendars = self.write()?;
        let current = calendars
            .get(calendar_id)
            .ok_or_else(|| StoreError::CalendarNotFound(calendar_id.to_string()))?;

        let ops = batch.len();
        let mut next = CalendarIndex::clone(current);
        for op in batch.into_ops() {
            next.apply(op);
        }
        self.persist(&next)?;
        calendars.insert(calendar_id.to_string(), Arc::new(next));

        tracing::trace!(calendar = calendar_id, ops, "applied batch");
        Ok(())
    }

    fn view(&self, calendar_id: &str) -> StoreResult<Arc<CalendarIndex>> {
        self.read()?
            .get(calendar_id)
            .cloned()
            .ok_or_else(|| StoreError::CalendarNotFound(calendar_id.to_string()))
    }
}
