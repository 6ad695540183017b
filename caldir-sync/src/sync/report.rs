use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::OrphanedException;
use crate::event::CalendarId;

/// Which kind of run completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub calendar_id: CalendarId,
    pub mode: SyncMode,
    pub pages: usize,
    pub upserted: usize,
    pub removed: usize,
    /// Local records deleted because a full sync never mentioned them.
    pub reconciled: usize,
    pub orphaned: Vec<OrphanedException>,
    /// Times this run restarted as a full sync after a rejected token.
    pub full_sync_fallbacks: u32,
    pub synced_at: DateTime<Utc>,
}

impl SyncReport {
    pub(crate) fn new(calendar_id: &str, mode: SyncMode) -> Self {
        SyncReport {
            calendar_id: calendar_id.to_string(),
            mode,
            pages: 0,
            upserted: 0,
            removed: 0,
            reconciled: 0,
            orphaned: Vec::new(),
            full_sync_fallbacks: 0,
            synced_at: Utc::now(),
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sync of {}: {} page(s), {} upserted, {} removed",
            self.mode, self.calendar_id, self.pages, self.upserted, self.removed
        )?;
        if self.reconciled > 0 {
            write!(f, ", {} reconciled", self.reconciled)?;
        }
        if !self.orphaned.is_empty() {
            write!(f, ", {} orphaned", self.orphaned.len())?;
        }
        Ok(())
    }
}
