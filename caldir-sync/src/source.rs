//! The remote side of a sync: a paginated feed of raw event changes.
//!
//! Transport, authentication and wire encoding live behind this trait.
//! Implementations must report a rejected sync or page token as
//! [`SourceError::TokenInvalid`] so the engine can fall back to a full sync.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::CalendarId;
use crate::raw::RawPage;

/// Parameters for one page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub calendar_id: CalendarId,
    /// Set on incremental runs, on every page.
    pub sync_token: Option<String>,
    /// Continuation within the current run. `None` for the first page.
    pub page_token: Option<String>,
    /// Lower bound on event end time. Set on full syncs only.
    pub time_min: Option<DateTime<Utc>>,
}

impl PageRequest {
    pub fn full(calendar_id: &str, time_min: DateTime<Utc>) -> Self {
        PageRequest {
            calendar_id: calendar_id.to_string(),
            sync_token: None,
            page_token: None,
            time_min: Some(time_min),
        }
    }

    pub fn incremental(calendar_id: &str, sync_token: &str) -> Self {
        PageRequest {
            calendar_id: calendar_id.to_string(),
            sync_token: Some(sync_token.to_string()),
            page_token: None,
            time_min: None,
        }
    }

    /// The same request, continued at `page_token`.
    pub fn next_page(&self, page_token: String) -> Self {
        PageRequest {
            page_token: Some(page_token),
            ..self.clone()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The remote rejected the sync or page token (HTTP 410 Gone for Google).
    #[error("Sync token invalid or expired")]
    TokenInvalid,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Capability to fetch a page of changes.
#[async_trait]
pub trait RawEventSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage, SourceError>;
}
