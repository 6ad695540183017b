//! Defaults shared across the crate.

use std::time::Duration;

/// Bump to discard every persisted sync token and force a reconciling full sync.
pub const STORE_VERSION: u32 = 1;

/// A full sync only asks for events that ended at most this many days ago.
pub const DEFAULT_FULL_SYNC_LOOKBACK_DAYS: i64 = 28;

/// A stalled page fetch fails the run after this long.
pub const DEFAULT_PAGE_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_FULL_SYNC_RESTARTS: u32 = 1;

/// First window searched by `next_occurrence`; doubled until `DEFAULT_MAX_LOOKAHEAD_DAYS`.
pub const DEFAULT_INITIAL_LOOKAHEAD_DAYS: u64 = 7;

pub const DEFAULT_MAX_LOOKAHEAD_DAYS: u64 = 4 * 366;

/// Upper bound on both the full-sync lookback and the lookahead, about a century.
pub const MAX_CONFIGURED_SPAN_DAYS: u64 = 36_500;

pub const DEFAULT_MAX_OCCURRENCES_PER_MASTER: u16 = 1000;

/// Separator between a master id and the occurrence instant in synthetic ids.
pub const SYNTHETIC_ID_DELIMITER: char = '_';
