//! Error types for caldir-sync.

use thiserror::Error;

use crate::event::EventId;

/// Errors surfaced by a sync run.
///
/// Payloads are plain strings so an outcome can be cloned and handed to
/// every caller waiting on the same run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network failure or a stalled page fetch. The sync token is untouched.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The remote rejected the held sync or page token and the run could
    /// not recover with a full sync.
    #[error("Sync token rejected by the remote source")]
    TokenInvalid,

    /// Local persistence failed while applying a page.
    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record in a page could not be decoded.
    #[error("Malformed event in page: {0}")]
    MalformedEvent(String),

    #[error("Calendar not registered: {0}")]
    CalendarNotFound(String),

    /// The run was cancelled between pages.
    #[error("Sync run cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether re-invoking the run may succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransportFailure(_)
                | SyncError::StoreUnavailable(_)
                | SyncError::TokenInvalid
                | SyncError::Cancelled
        )
    }
}

/// Result type alias for sync runs.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by an [`EventStore`](crate::store::EventStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O or encoding failure in the backing storage.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Calendar not registered: {0}")]
    CalendarNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CalendarNotFound(id) => SyncError::CalendarNotFound(id),
            other => SyncError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A raw record that could not be turned into an [`EventRecord`](crate::event::EventRecord).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Event has no id")]
    MissingId,

    #[error("Event '{0}' has no start time")]
    MissingStart(String),

    #[error("Event '{0}' has no end time")]
    MissingEnd(String),

    #[error("Event '{0}' overrides an occurrence but has no original start time")]
    MissingOriginalStart(String),

    #[error("Event '{0}' ends before it starts")]
    EndBeforeStart(String),

    #[error("Event '{id}' has an unknown time zone '{tz}'")]
    UnknownTimeZone { id: String, tz: String },

    #[error("Event '{0}' mixes all-day and timed boundaries")]
    MixedBoundaries(String),
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::MalformedEvent(err.to_string())
    }
}

/// A recurrence exception whose master never appeared during a run.
///
/// Not fatal: the exception is retained so a later run can bring the master.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Exception '{event_id}' references missing master '{master_id}'")]
pub struct OrphanedException {
    pub event_id: EventId,
    pub master_id: EventId,
}

/// A master whose recurrence lines could not be expanded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid recurrence for event '{event_id}': {reason}")]
pub struct RecurrenceError {
    pub event_id: EventId,
    pub reason: String,
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
