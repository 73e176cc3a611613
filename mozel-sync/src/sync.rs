//! The sync coordinator.
//!
//! [`MozelSync`] owns one [`MozelWatcher`] per tracked entity and batches
//! commits and merges across all of them. It is a cheap, cloneable handle;
//! callbacks registered on entities and the registry only hold it weakly.

use crate::commit::{Commit, CommitBatch};
use crate::config::{SyncConfig, WatcherOptions};
use crate::error::{OutdatedUpdateError, SyncError, SyncResult};
use crate::watcher::MozelWatcher;
use mozel_model::{ListenerId, Mozel, Registry, RegistryEvent};
use mozel_types::{Gid, SyncId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the "new commits" broadcast channel.
const COMMIT_CHANNEL_CAPACITY: usize = 64;

/// Outcome of a batch merge.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Merged commits with overridden paths removed, ready to relay.
    pub commits: CommitBatch,
    /// Entities no watcher was found for, even after retrying.
    pub unresolved: Vec<Gid>,
    /// Commits based on a version outside the local history window. The
    /// sender should be asked for a full state.
    pub outdated: BTreeMap<Gid, OutdatedUpdateError>,
    /// Commits that could not be applied to the entity model.
    pub failed: BTreeMap<Gid, SyncError>,
}

impl MergeReport {
    /// The merged commits that still carry changes.
    pub fn relay(&self) -> CommitBatch {
        self.commits
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(gid, c)| (gid.clone(), c.clone()))
            .collect()
    }
}

struct Registration {
    watcher: Arc<MozelWatcher>,
    destroy_listener: ListenerId,
}

struct SyncInner {
    sync_id: SyncId,
    priority: i64,
    history_max_length: usize,
    auto_commit: Option<Duration>,
    watchers: RwLock<HashMap<Gid, Registration>>,
    /// Entities registered since the last commit; their parents export them
    /// in full.
    new_mozels: Mutex<HashSet<Gid>>,
    registry: Mutex<Option<(Registry, ListenerId)>>,
    active: AtomicBool,
    destroyed: AtomicBool,
    commit_scheduled: AtomicBool,
    commits_tx: broadcast::Sender<CommitBatch>,
}

/// Coordinates the watchers of every tracked entity.
#[derive(Clone)]
pub struct MozelSync {
    inner: Arc<SyncInner>,
}

impl MozelSync {
    pub fn new(config: SyncConfig) -> Self {
        let (commits_tx, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SyncInner {
                sync_id: config.sync_id.unwrap_or_default(),
                priority: config.priority,
                history_max_length: config.history_max_length,
                auto_commit: config.auto_commit,
                watchers: RwLock::new(HashMap::new()),
                new_mozels: Mutex::new(HashSet::new()),
                registry: Mutex::new(None),
                active: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                commit_scheduled: AtomicBool::new(false),
                commits_tx,
            }),
        }
    }

    fn from_weak(weak: &Weak<SyncInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn sync_id(&self) -> &SyncId {
        &self.inner.sync_id
    }

    pub fn priority(&self) -> i64 {
        self.inner.priority
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Receives every non-empty batch produced by [`MozelSync::commit`].
    pub fn subscribe(&self) -> broadcast::Receiver<CommitBatch> {
        self.inner.commits_tx.subscribe()
    }

    // ── Registration ─────────────────────────────────────────────

    /// Starts tracking an entity. Registering a tracked entity is a no-op.
    pub fn register(&self, mozel: &Mozel) -> SyncResult<()> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        let gid = mozel.gid().clone();
        if self.inner.watchers.read().contains_key(&gid) {
            return Ok(());
        }

        let watcher = MozelWatcher::new(
            mozel.clone(),
            WatcherOptions {
                sync_id: self.inner.sync_id.clone(),
                priority: self.inner.priority,
                history_max_length: self.inner.history_max_length,
            },
        );
        if self.inner.auto_commit.is_some() {
            let weak = Arc::downgrade(&self.inner);
            watcher.on_change(move |_| {
                if let Some(sync) = Self::from_weak(&weak) {
                    sync.schedule_auto_commit();
                }
            });
        }
        let weak = Arc::downgrade(&self.inner);
        let destroy_listener = mozel.on_destroyed(move |destroyed| {
            if let Some(sync) = Self::from_weak(&weak) {
                sync.unregister(destroyed);
            }
        });

        {
            let mut watchers = self.inner.watchers.write();
            if watchers.contains_key(&gid) {
                drop(watchers);
                mozel.off_destroyed(destroy_listener);
                return Ok(());
            }
            watchers.insert(
                gid.clone(),
                Registration {
                    watcher: watcher.clone(),
                    destroy_listener,
                },
            );
        }
        self.inner.new_mozels.lock().insert(gid.clone());
        if self.is_active() {
            watcher.start(false);
        }
        debug!(%gid, entity_type = mozel.entity_type(), "mozel registered for sync");
        Ok(())
    }

    /// Stops tracking an entity. Unknown entities are ignored.
    pub fn unregister(&self, mozel: &Mozel) {
        let removed = self.inner.watchers.write().remove(mozel.gid());
        if let Some(registration) = removed {
            mozel.off_destroyed(registration.destroy_listener);
            registration.watcher.destroy();
            self.inner.new_mozels.lock().remove(mozel.gid());
            debug!(gid = %mozel.gid(), "mozel unregistered from sync");
        }
    }

    /// Mirrors a registry: tracks every entity it holds now and every entity
    /// added later, and forgets removed ones. Only one registry can be
    /// attached.
    pub fn sync_registry(&self, registry: &Registry) -> SyncResult<()> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        {
            let mut attached = self.inner.registry.lock();
            if attached.is_some() {
                return Err(SyncError::RegistryAlreadyAttached);
            }
            let weak = Arc::downgrade(&self.inner);
            let listener = registry.on_event(move |event| {
                let Some(sync) = Self::from_weak(&weak) else {
                    return;
                };
                match event {
                    RegistryEvent::Added(mozel) => {
                        if let Err(err) = sync.register(mozel) {
                            debug!(gid = %mozel.gid(), error = %err, "registration skipped");
                        }
                    }
                    RegistryEvent::Removed(mozel) => sync.unregister(mozel),
                }
            });
            *attached = Some((registry.clone(), listener));
        }

        let existing = registry.list_all();
        info!(count = existing.len(), "registry attached");
        for mozel in &existing {
            self.register(mozel)?;
        }
        Ok(())
    }

    /// The watcher of a tracked entity.
    pub fn watcher(&self, gid: &Gid) -> Option<Arc<MozelWatcher>> {
        self.inner
            .watchers
            .read()
            .get(gid)
            .map(|r| r.watcher.clone())
    }

    pub fn watched_gids(&self) -> Vec<Gid> {
        let mut gids: Vec<Gid> = self.inner.watchers.read().keys().cloned().collect();
        gids.sort();
        gids
    }

    fn watchers(&self) -> Vec<(Gid, Arc<MozelWatcher>)> {
        let mut watchers: Vec<_> = self
            .inner
            .watchers
            .read()
            .iter()
            .map(|(gid, r)| (gid.clone(), r.watcher.clone()))
            .collect();
        watchers.sort_by(|a, b| a.0.cmp(&b.0));
        watchers
    }

    // ── Commit ───────────────────────────────────────────────────

    pub fn has_changes(&self) -> bool {
        self.watchers().iter().any(|(_, w)| w.has_changes())
    }

    /// Commits every watcher with pending changes and announces the batch.
    pub fn commit(&self) -> CommitBatch {
        let new_mozels = self.inner.new_mozels.lock().clone();
        let is_new = |gid: &Gid| new_mozels.contains(gid);
        let batch: CommitBatch = self
            .watchers()
            .into_iter()
            .filter_map(|(gid, watcher)| watcher.commit_with(&is_new).map(|c| (gid, c)))
            .collect();
        self.inner
            .new_mozels
            .lock()
            .retain(|gid| !new_mozels.contains(gid));

        if !batch.is_empty() {
            debug!(entities = batch.len(), "commit batch produced");
            // No receivers is fine.
            let _ = self.inner.commits_tx.send(batch.clone());
        }
        batch
    }

    /// Full states of every tracked entity.
    pub fn create_full_states(&self) -> CommitBatch {
        self.watchers()
            .into_iter()
            .map(|(gid, watcher)| (gid, watcher.create_full_state()))
            .collect()
    }

    // ── Merge ────────────────────────────────────────────────────

    /// Merges a batch of commits from a peer.
    ///
    /// A commit may target an entity that another commit of the same batch
    /// creates, so entries without a watcher are retried until a pass makes
    /// no progress. Whatever is left is reported as unresolved.
    pub fn merge(&self, batch: CommitBatch) -> MergeReport {
        self.merge_with(batch, |watcher, commit| watcher.merge(commit))
    }

    /// Applies full states (first contact or resync after an outdated
    /// update) with the same retry rules as [`MozelSync::merge`].
    pub fn apply_full_states(&self, batch: CommitBatch) -> MergeReport {
        self.merge_with(batch, |watcher, commit| {
            watcher.reset_from_full_state(&commit)?;
            Ok(commit)
        })
    }

    fn merge_with(
        &self,
        batch: CommitBatch,
        apply: impl Fn(&MozelWatcher, Commit) -> SyncResult<Commit>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut queue: Vec<(Gid, Commit)> = batch.into_iter().collect();

        while !queue.is_empty() {
            let before = queue.len();
            let mut deferred = Vec::new();
            for (gid, commit) in queue {
                let Some(watcher) = self.watcher(&gid) else {
                    deferred.push((gid, commit));
                    continue;
                };
                match apply(&watcher, commit) {
                    Ok(merged) => {
                        report.commits.insert(gid, merged);
                    }
                    Err(SyncError::Outdated(err)) => {
                        report.outdated.insert(gid, err);
                    }
                    Err(err) => {
                        warn!(%gid, error = %err, "failed to merge commit");
                        report.failed.insert(gid, err);
                    }
                }
            }
            queue = deferred;
            if queue.len() == before {
                break;
            }
        }

        if !queue.is_empty() {
            let gids: Vec<Gid> = queue.into_iter().map(|(gid, _)| gid).collect();
            warn!(unresolved = ?gids, "dropping commits for unknown entities");
            report.unresolved = gids;
        }
        debug!(
            merged = report.commits.len(),
            outdated = report.outdated.len(),
            "batch merged"
        );
        report
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts recording changes on every tracked entity.
    pub fn start(&self) {
        if self.is_destroyed() {
            return;
        }
        self.inner.active.store(true, Ordering::SeqCst);
        for (_, watcher) in self.watchers() {
            watcher.start(false);
        }
    }

    /// Stops recording changes. Pending changes are kept.
    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        for (_, watcher) in self.watchers() {
            watcher.stop();
        }
    }

    /// Detaches from the registry and forgets every entity. Terminal.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        let attached = self.inner.registry.lock().take();
        if let Some((registry, listener)) = attached {
            registry.off_event(listener);
        }
        let registrations: Vec<Registration> = self
            .inner
            .watchers
            .write()
            .drain()
            .map(|(_, r)| r)
            .collect();
        for registration in registrations {
            registration
                .watcher
                .mozel()
                .off_destroyed(registration.destroy_listener);
            registration.watcher.destroy();
        }
        self.inner.new_mozels.lock().clear();
        info!(sync_id = %self.inner.sync_id, "sync destroyed");
    }

    // ── Auto-commit ──────────────────────────────────────────────

    /// Schedules one commit after the auto-commit interval unless one is
    /// already pending.
    fn schedule_auto_commit(&self) {
        let Some(interval) = self.inner.auto_commit else {
            return;
        };
        if self.inner.commit_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("auto-commit requires a tokio runtime; skipping");
            self.inner.commit_scheduled.store(false, Ordering::SeqCst);
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(sync) = Self::from_weak(&weak) {
                sync.inner.commit_scheduled.store(false, Ordering::SeqCst);
                if !sync.is_destroyed() {
                    sync.commit();
                }
            }
        });
    }
}

impl std::fmt::Debug for MozelSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MozelSync")
            .field("sync_id", &self.inner.sync_id)
            .field("priority", &self.inner.priority)
            .field("watchers", &self.inner.watchers.read().len())
            .finish()
    }
}
