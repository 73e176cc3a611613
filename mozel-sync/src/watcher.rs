//! Per-entity change tracking and merging.
//!
//! A [`MozelWatcher`] listens to the top-level properties of one entity,
//! coalesces what changed into a pending change set, turns it into versioned
//! [`Commit`]s and merges commits from peers against its bounded history.

use crate::commit::{Changes, Commit};
use crate::config::WatcherOptions;
use crate::error::{OutdatedUpdateError, SyncError, SyncResult};
use crate::history::{History, HistoryEntry};
use mozel_model::{ListenerId, Mozel, PathChange, WatchId, WatchOptions};
use mozel_types::{Gid, SyncId};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

/// Callback invoked whenever the watcher records a local change.
pub type ChangeListener = Arc<dyn Fn(&Gid) + Send + Sync>;

struct WatcherState {
    version: u64,
    history: History,
    changes: Changes,
    /// Sequence number of the last recording of each pending path.
    recorded_at: HashMap<String, u64>,
    recorded: u64,
    sync_base_versions: HashMap<SyncId, u64>,
    /// Thread currently writing merged changes into the entity. Changes it
    /// causes are not local edits.
    merging_on: Option<ThreadId>,
    watch_id: Option<WatchId>,
    destroyed: bool,
}

impl WatcherState {
    /// The highest version integrated from any peer.
    fn integrated_version(&self) -> u64 {
        self.sync_base_versions.values().copied().max().unwrap_or(0)
    }

    fn clear_changes(&mut self) {
        self.changes.clear();
        self.recorded_at.clear();
    }

    /// Drops pending paths last recorded at or before `mark`. Edits recorded
    /// later (from another thread during a merge) stay pending.
    fn drop_pending<'a>(&mut self, paths: impl IntoIterator<Item = &'a String>, mark: u64) {
        for path in paths {
            if self.recorded_at.get(path).is_some_and(|seq| *seq <= mark) {
                self.changes.remove(path);
                self.recorded_at.remove(path);
            }
        }
    }
}

/// Tracks and merges the changes of one entity.
pub struct MozelWatcher {
    mozel: Mozel,
    sync_id: SyncId,
    priority: i64,
    state: Mutex<WatcherState>,
    /// Serializes commit, merge and reset. Reentrant so a handler running
    /// inside a merge may commit on the same thread.
    txn: ReentrantMutex<()>,
    change_listeners: RwLock<Vec<ChangeListener>>,
    destroy_listener: Mutex<Option<ListenerId>>,
}

impl MozelWatcher {
    /// Creates a stopped watcher. It destroys itself when the entity is
    /// destroyed.
    pub fn new(mozel: Mozel, options: WatcherOptions) -> Arc<Self> {
        let watcher = Arc::new(Self {
            mozel: mozel.clone(),
            sync_id: options.sync_id,
            priority: options.priority,
            state: Mutex::new(WatcherState {
                version: 0,
                history: History::new(options.history_max_length),
                changes: Changes::new(),
                recorded_at: HashMap::new(),
                recorded: 0,
                sync_base_versions: HashMap::new(),
                merging_on: None,
                watch_id: None,
                destroyed: false,
            }),
            txn: ReentrantMutex::new(()),
            change_listeners: RwLock::new(Vec::new()),
            destroy_listener: Mutex::new(None),
        });
        let weak = Arc::downgrade(&watcher);
        let id = mozel.on_destroyed(move |_| {
            if let Some(watcher) = weak.upgrade() {
                watcher.destroy();
            }
        });
        *watcher.destroy_listener.lock() = Some(id);
        watcher
    }

    pub fn mozel(&self) -> &Mozel {
        &self.mozel
    }

    pub fn gid(&self) -> &Gid {
        self.mozel.gid()
    }

    pub fn sync_id(&self) -> &SyncId {
        &self.sync_id
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().watch_id.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts recording changes. With `include_current_state`, every property
    /// is marked as changed so the next commit carries the whole entity.
    pub fn start(self: &Arc<Self>, include_current_state: bool) {
        {
            let state = self.state.lock();
            if state.destroyed {
                debug!(gid = %self.gid(), "start ignored: watcher destroyed");
                return;
            }
            if state.watch_id.is_some() {
                return;
            }
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let watched = self.mozel.watch("*", WatchOptions::default(), move |change| {
            if let Some(watcher) = weak.upgrade() {
                watcher.record(change);
            }
        });
        let id = match watched {
            Ok(id) => id,
            Err(err) => {
                warn!(gid = %self.gid(), error = %err, "failed to watch entity");
                return;
            }
        };

        let mut state = self.state.lock();
        state.watch_id = Some(id);
        if include_current_state {
            for name in self.mozel.property_names() {
                let value = self.mozel.get_value(&name).unwrap_or(Value::Null);
                state.recorded += 1;
                let seq = state.recorded;
                state.recorded_at.insert(name.clone(), seq);
                state.changes.insert(name, value);
            }
        }
    }

    /// Stops recording changes. Pending changes are kept.
    pub fn stop(&self) {
        let id = self.state.lock().watch_id.take();
        if let Some(id) = id {
            self.mozel.unwatch(id);
        }
    }

    /// Stops the watcher for good.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        self.stop();
        if let Some(id) = self.destroy_listener.lock().take() {
            self.mozel.off_destroyed(id);
        }
        self.change_listeners.write().clear();
        debug!(gid = %self.gid(), "watcher destroyed");
    }

    /// Registers a listener for recorded local changes.
    pub fn on_change(&self, listener: impl Fn(&Gid) + Send + Sync + 'static) {
        self.change_listeners.write().push(Arc::new(listener));
    }

    fn record(&self, change: &PathChange) {
        {
            let mut state = self.state.lock();
            if state.merging_on == Some(thread::current().id()) {
                return;
            }
            let value = change.new_value.clone().unwrap_or(Value::Null);
            state.recorded += 1;
            let seq = state.recorded;
            state.recorded_at.insert(change.path.clone(), seq);
            state.changes.insert(change.path.clone(), value);
        }

        let listeners: Vec<ChangeListener> = self.change_listeners.read().clone();
        for listener in listeners {
            listener(self.gid());
        }
    }

    // ── Changes & history ────────────────────────────────────────

    pub fn has_changes(&self) -> bool {
        !self.state.lock().changes.is_empty()
    }

    /// The pending change set, with values as last observed.
    pub fn changes(&self) -> Changes {
        self.state.lock().changes.clone()
    }

    pub fn clear_changes(&self) {
        self.state.lock().clear_changes();
    }

    /// Retained history, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().history.entries()
    }

    /// Forgets history up to `from_base_version`, or all of it. A peer's
    /// commit based below a forgotten entry of another origin is rejected as
    /// outdated afterwards.
    pub fn clear_history(&self, from_base_version: Option<u64>) {
        let mut state = self.state.lock();
        let up_to = from_base_version.unwrap_or(state.version);
        state.history.clear(up_to);
    }

    /// Highest integrated version per peer.
    pub fn sync_base_versions(&self) -> HashMap<SyncId, u64> {
        self.state.lock().sync_base_versions.clone()
    }

    /// The oldest `baseVersion` a commit may have and still be merged. A
    /// peer whose own entries were the only ones forgotten may go lower.
    pub fn history_min_base_version(&self) -> u64 {
        self.state.lock().history.min_base_version()
    }

    // ── Commit ───────────────────────────────────────────────────

    /// Commits pending changes with child entities exported by reference.
    pub fn commit(&self) -> Option<Commit> {
        self.commit_with(&|_| false)
    }

    /// Commits pending changes. Child entities for which `is_new` returns
    /// true are exported in full so a peer can create them.
    ///
    /// The base version is the highest version integrated from a peer, not
    /// the previous local version: a peer's concurrent commits may share
    /// version numbers with local ones the receiver has never seen.
    pub fn commit_with(&self, is_new: &dyn Fn(&Gid) -> bool) -> Option<Commit> {
        let _txn = self.txn.lock();
        let mut state = self.state.lock();
        if state.destroyed || state.changes.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut state.changes);
        state.recorded_at.clear();
        let changes: Changes = pending
            .into_iter()
            .map(|(path, recorded)| {
                let value = self
                    .mozel
                    .export_property_with(&path, is_new)
                    .unwrap_or(recorded);
                (path, value)
            })
            .collect();

        let base_version = state.integrated_version();
        state.version += 1;
        let commit = Commit {
            sync_id: self.sync_id.clone(),
            version: state.version,
            priority: self.priority,
            base_version,
            changes,
        };
        state.history.record(HistoryEntry::from_commit(&commit));
        debug!(
            gid = %self.gid(),
            version = commit.version,
            paths = commit.changes.len(),
            "commit produced"
        );
        Some(commit)
    }

    /// The whole entity as a commit, for first contact or resync.
    pub fn create_full_state(&self) -> Commit {
        let version = self.state.lock().version;
        let changes = match self.mozel.export_full() {
            Value::Object(obj) => obj.into_iter().filter(|(k, _)| k != "gid").collect(),
            _ => Changes::new(),
        };
        Commit {
            sync_id: self.sync_id.clone(),
            version,
            priority: self.priority,
            base_version: 0,
            changes,
        }
    }

    // ── Merge ────────────────────────────────────────────────────

    /// Merges a peer's commit.
    ///
    /// Paths the local history changed since the commit's base version are
    /// decided by priority, then version, then sync id; losing paths are
    /// stripped. The surviving changes are applied and the stripped commit
    /// is returned for relaying. A commit already integrated comes back with
    /// no changes.
    pub fn merge(&self, mut update: Commit) -> SyncResult<Commit> {
        let _txn = self.txn.lock();
        let mark = {
            let state = self.state.lock();
            if state.destroyed {
                return Err(SyncError::Destroyed);
            }
            let integrated = update.sync_id == self.sync_id
                || state.history.contains(update.version, &update.sync_id)
                || state
                    .sync_base_versions
                    .get(&update.sync_id)
                    .is_some_and(|v| update.version <= *v);
            if integrated {
                debug!(gid = %self.gid(), version = update.version, "commit already integrated");
                update.changes.clear();
                return Ok(update);
            }

            let required = state.history.min_base_version_for(&update.sync_id);
            if update.base_version < required {
                warn!(
                    gid = %self.gid(),
                    base_version = update.base_version,
                    required_version = required,
                    "outdated update"
                );
                return Err(OutdatedUpdateError {
                    base_version: update.base_version,
                    required_version: required,
                }
                .into());
            }

            let overridden = override_changes_from_history(&state.history, &update);
            if !overridden.is_empty() {
                debug!(
                    gid = %self.gid(),
                    version = update.version,
                    paths = ?overridden,
                    "paths overridden by local history"
                );
            }
            update.remove_changes(&overridden);
            state.recorded
        };

        if !update.is_empty() {
            self.apply(&update.data(), true)?;
        }

        let mut state = self.state.lock();
        state.drop_pending(update.changes.keys(), mark);
        let base = state
            .sync_base_versions
            .entry(update.sync_id.clone())
            .or_insert(0);
        *base = (*base).max(update.version);
        state.version = state.version.max(update.version);
        state.history.record(HistoryEntry::from_commit(&update));
        debug!(
            gid = %self.gid(),
            version = update.version,
            paths = update.changes.len(),
            "commit merged"
        );
        Ok(update)
    }

    /// Replaces the entity with a full state, discarding local pending
    /// changes and the history the full state supersedes.
    pub fn reset_from_full_state(&self, full_state: &Commit) -> SyncResult<()> {
        let _txn = self.txn.lock();
        let mark = {
            let state = self.state.lock();
            if state.destroyed {
                return Err(SyncError::Destroyed);
            }
            state.recorded
        };
        self.apply(&full_state.data(), false)?;

        let mut state = self.state.lock();
        let pending: Vec<String> = state.changes.keys().cloned().collect();
        state.drop_pending(pending.iter(), mark);
        state.version = state.version.max(full_state.version);
        state.history.clear(full_state.version);
        if full_state.sync_id != self.sync_id {
            let base = state
                .sync_base_versions
                .entry(full_state.sync_id.clone())
                .or_insert(0);
            *base = (*base).max(full_state.version);
        }
        debug!(gid = %self.gid(), version = full_state.version, "reset from full state");
        Ok(())
    }

    /// Writes remote data into the entity. Changes observed on this thread
    /// meanwhile are the write itself and are not recorded.
    fn apply(&self, data: &Value, merge: bool) -> SyncResult<()> {
        let current = thread::current().id();
        let previous = self.state.lock().merging_on.replace(current);
        let applied = self.mozel.set_data(data, merge);
        self.state.lock().merging_on = previous;
        Ok(applied?)
    }
}

/// Paths of `update` that lose against a history entry from another peer
/// recorded after the update's base version.
fn override_changes_from_history(history: &History, update: &Commit) -> BTreeSet<String> {
    history
        .after(update.base_version)
        .filter(|entry| entry.sync_id != update.sync_id && entry.beats(update))
        .flat_map(|entry| entry.changes.keys())
        .filter(|path| update.changes.contains_key(*path))
        .cloned()
        .collect()
}

impl Drop for MozelWatcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for MozelWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MozelWatcher")
            .field("gid", self.gid())
            .field("sync_id", &self.sync_id)
            .field("version", &self.version())
            .finish()
    }
}
