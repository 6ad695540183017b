//! Incremental calendar sync with an indexed local event store.
//!
//! Three parts: a [`SyncEngine`] that pulls paginated changes from a
//! [`RawEventSource`] into an [`EventStore`], a [`TimelineBuilder`] that
//! answers occurrence queries (expanding recurring series) from the store,
//! and a [`SyncCoordinator`] that lets callers force a sync without
//! starting overlapping runs. [`CalendarReplica`] ties them together.

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod raw;
pub mod recurrence;
pub mod replica;
pub mod source;
pub mod store;
pub mod sync;
pub mod timeline;

pub use config::{SyncConfig, TimelineConfig};
pub use coordinator::SyncCoordinator;
pub use error::{
    DecodeError, OrphanedException, RecurrenceError, StoreError, StoreResult, SyncError,
    SyncResult,
};
pub use event::{Calendar, CalendarId, EventId, EventKind, EventRecord, EventStatus, EventTime};
pub use raw::{RawEvent, RawPage, RawTime};
pub use replica::CalendarReplica;
pub use source::{PageRequest, RawEventSource, SourceError};
pub use store::{CalendarIndex, EventStore, LocalStore, WriteBatch};
pub use sync::{CalendarSyncState, SyncEngine, SyncMode, SyncOutcome, SyncPhase, SyncReport};
pub use timeline::{Occurrence, Timeline, TimelineBuilder};
