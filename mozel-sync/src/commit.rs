//! Commits: the unit of exchange between sync instances.

use mozel_types::{Gid, SyncId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Coalesced edits of one entity: property path to its latest value.
pub type Changes = BTreeMap<String, Value>;

/// Commits of many entities, keyed by gid.
pub type CommitBatch = BTreeMap<Gid, Commit>;

/// A versioned set of changes to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// The sync instance that produced the changes.
    #[serde(rename = "syncID")]
    pub sync_id: SyncId,
    /// Entity version after this commit.
    pub version: u64,
    pub priority: i64,
    /// Version the producer had reached before this commit.
    #[serde(rename = "baseVersion")]
    pub base_version: u64,
    pub changes: Changes,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Drops the given paths from the changes.
    pub fn remove_changes<'a>(&mut self, paths: impl IntoIterator<Item = &'a String>) {
        for path in paths {
            self.changes.remove(path);
        }
    }

    /// The changes as a JSON object, ready for `Mozel::set_data`.
    pub fn data(&self) -> Value {
        let obj: Map<String, Value> = self
            .changes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(obj)
    }
}
