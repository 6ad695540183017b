//! Exceptions held back within one run until their master shows up.

use std::collections::{BTreeMap, HashMap};

use crate::event::{EventId, EventRecord};

/// Keyed by master id, then exception id. A later copy of the same
/// exception replaces the earlier one.
#[derive(Debug, Default)]
pub(crate) struct PendingExceptions {
    by_master: HashMap<EventId, BTreeMap<EventId, EventRecord>>,
}

impl PendingExceptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&mut self, exception: EventRecord) {
        let Some(master_id) = exception.master_id().cloned() else {
            return;
        };
        self.by_master
            .entry(master_id)
            .or_default()
            .insert(exception.id.clone(), exception);
    }

    /// Hand back everything waiting on `master_id`, ordered by id.
    pub fn release(&mut self, master_id: &str) -> Vec<EventRecord> {
        self.by_master
            .remove(master_id)
            .map(|held| held.into_values().collect())
            .unwrap_or_default()
    }

    /// Forget everything waiting on a master that was cancelled.
    pub fn drop_master(&mut self, master_id: &str) -> usize {
        self.by_master
            .remove(master_id)
            .map_or(0, |held| held.len())
    }

    /// Everything still held, ordered by master then exception id.
    pub fn drain(&mut self) -> Vec<EventRecord> {
        let mut masters: Vec<EventId> = self.by_master.keys().cloned().collect();
        masters.sort();
        masters
            .into_iter()
            .flat_map(|master_id| self.release(&master_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_master.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_master.is_empty()
    }
}
