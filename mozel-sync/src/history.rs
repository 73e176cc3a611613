//! Bounded commit history of one watcher.
//!
//! A fixed ring of `capacity` version slots indexed by `version % capacity`.
//! A slot holds every entry recorded for its version (a relay can integrate
//! several peers' commits that share a version number). Recording a newer
//! version into a slot evicts the older one, so the reconciliation window is
//! always the last `capacity` versions.
//!
//! Evicted and cleared entries are remembered only as the highest forgotten
//! version per origin. A commit can be reconciled precisely as long as no
//! forgotten entry from another origin is newer than its base version.

use crate::commit::{Changes, Commit};
use mozel_types::SyncId;
use std::collections::HashMap;

/// One recorded commit, local or integrated from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub version: u64,
    pub sync_id: SyncId,
    pub priority: i64,
    pub changes: Changes,
}

impl HistoryEntry {
    pub fn from_commit(commit: &Commit) -> Self {
        Self {
            version: commit.version,
            sync_id: commit.sync_id.clone(),
            priority: commit.priority,
            changes: commit.changes.clone(),
        }
    }

    /// Whether this entry's claim on a shared path beats the update's:
    /// higher priority, then higher version, then the greater sync id.
    pub fn beats(&self, update: &Commit) -> bool {
        (self.priority, self.version, &self.sync_id)
            > (update.priority, update.version, &update.sync_id)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    version: u64,
    entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct History {
    slots: Vec<Option<Slot>>,
    /// Highest version of a forgotten entry with changes, per origin.
    forgotten: HashMap<SyncId, u64>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            forgotten: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, version: u64) -> usize {
        (version % self.slots.len() as u64) as usize
    }

    fn forget(&mut self, entry: &HistoryEntry) {
        if entry.changes.is_empty() {
            return;
        }
        let max = self.forgotten.entry(entry.sync_id.clone()).or_insert(0);
        *max = (*max).max(entry.version);
    }

    /// The oldest base version any commit may have.
    pub fn min_base_version(&self) -> u64 {
        self.forgotten.values().copied().max().unwrap_or(0)
    }

    /// The oldest base version a commit from `sender` may have. The sender's
    /// own forgotten entries never conflict with its commits.
    pub fn min_base_version_for(&self, sender: &SyncId) -> u64 {
        self.forgotten
            .iter()
            .filter(|(origin, _)| *origin != sender)
            .map(|(_, version)| *version)
            .max()
            .unwrap_or(0)
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        let index = self.index(entry.version);
        let evicted = match &mut self.slots[index] {
            Some(slot) if slot.version == entry.version => {
                slot.entries.push(entry);
                return;
            }
            // Older than what the window already holds.
            Some(slot) if slot.version > entry.version => vec![entry],
            other => other
                .replace(Slot {
                    version: entry.version,
                    entries: vec![entry],
                })
                .map(|slot| slot.entries)
                .unwrap_or_default(),
        };
        for old in &evicted {
            self.forget(old);
        }
    }

    fn live(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.slots
            .iter()
            .flatten()
            .flat_map(|slot| slot.entries.iter())
    }

    pub fn contains(&self, version: u64, sync_id: &SyncId) -> bool {
        self.live()
            .any(|e| e.version == version && &e.sync_id == sync_id)
    }

    /// Entries recorded after `base_version`. Callers check the window first.
    pub fn after(&self, base_version: u64) -> impl Iterator<Item = &HistoryEntry> {
        self.live().filter(move |e| e.version > base_version)
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        let mut entries: Vec<_> = self.live().cloned().collect();
        entries.sort_by_key(|e| e.version);
        entries
    }

    /// Forgets every entry up to and including `version`.
    pub fn clear(&mut self, version: u64) {
        let mut cleared = Vec::new();
        for slot in &mut self.slots {
            if let Some(old) = slot.take_if(|s| s.version <= version) {
                cleared.extend(old.entries);
            }
        }
        for old in &cleared {
            self.forget(old);
        }
    }
}
