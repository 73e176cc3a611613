//! Path-pattern change watchers.
//!
//! A [`PathChangeWatcher`] is attached to one entity and observes every change
//! announced on that entity or bubbled up from its descendants. Before a
//! mutation it snapshots the values its pattern resolves to; after the
//! mutation it reports each concrete path whose value actually changed.
//!
//! Snapshots ("baselines") live for one tick: the outermost model mutation.
//! Nested mutations inside that call (a `set_data` creating children, for
//! instance) share the baselines, so each path is reported once per
//! effective transition. Baselines are dropped when the outermost call
//! returns.

use crate::mozel::Mozel;
use crate::path::{self, PathPattern};
use parking_lot::Mutex;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

/// Handle returned by [`Mozel::watch`], used to unwatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub(crate) u64);

/// Options for [`Mozel::watch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Also fire for changes below the watched path, and compare structural
    /// deep copies rather than identities.
    pub deep: bool,
    /// Fire once on registration with the current values.
    pub immediate: bool,
}

impl WatchOptions {
    pub fn deep() -> Self {
        Self {
            deep: true,
            immediate: false,
        }
    }

    pub fn immediate() -> Self {
        Self {
            deep: false,
            immediate: true,
        }
    }
}

/// One observed transition at a concrete path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathChange {
    pub path: String,
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

/// Callback invoked for every observed transition.
pub type WatchHandler = Arc<dyn Fn(&PathChange) + Send + Sync>;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static TOUCHED: RefCell<Vec<Arc<PathChangeWatcher>>> = const { RefCell::new(Vec::new()) };
}

struct TickGuard;

impl Drop for TickGuard {
    fn drop(&mut self) {
        let outermost = DEPTH.with(|d| {
            let depth = d.get().saturating_sub(1);
            d.set(depth);
            depth == 0
        });
        if outermost {
            let touched = TOUCHED.with(|t| std::mem::take(&mut *t.borrow_mut()));
            for watcher in touched {
                watcher.reset();
            }
        }
    }
}

/// Runs one model mutation as part of the current tick, opening a new tick
/// if none is active.
pub(crate) fn tick<R>(f: impl FnOnce() -> R) -> R {
    DEPTH.with(|d| d.set(d.get() + 1));
    let _guard = TickGuard;
    f()
}

fn mark_touched(watcher: Arc<PathChangeWatcher>) {
    if DEPTH.with(Cell::get) > 0 {
        TOUCHED.with(|t| t.borrow_mut().push(watcher));
    }
}

fn related(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b).all(|(x, y)| x == y)
}

/// Watches one path pattern on an entity.
pub struct PathChangeWatcher {
    pattern: PathPattern,
    options: WatchOptions,
    handler: WatchHandler,
    baselines: Mutex<HashMap<Vec<String>, Option<Value>>>,
}

impl PathChangeWatcher {
    pub fn new(pattern: PathPattern, options: WatchOptions, handler: WatchHandler) -> Self {
        Self {
            pattern,
            options,
            handler,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn options(&self) -> WatchOptions {
        self.options
    }

    /// Whether a change at `changed` (relative to the watched entity)
    /// concerns this watcher.
    pub fn matches(&self, changed: &[String]) -> bool {
        self.pattern.matches(changed, self.options.deep)
    }

    /// Drops all baselines.
    pub fn reset(&self) {
        self.baselines.lock().clear();
    }

    fn snapshot(&self, root: &Mozel, path: &[String]) -> Option<Value> {
        root.get_segments(path)
            .map(|node| node.export(self.options.deep))
    }

    pub(crate) fn before_change(self: &Arc<Self>, root: &Mozel, changed: &[String]) {
        let snapshots: Vec<_> = self
            .pattern
            .resolve(root, changed)
            .into_iter()
            .map(|p| {
                let value = self.snapshot(root, &p);
                (p, value)
            })
            .collect();

        let mut baselines = self.baselines.lock();
        let first_in_tick = baselines.is_empty();
        for (p, value) in snapshots {
            baselines.entry(p).or_insert(value);
        }
        drop(baselines);
        if first_in_tick {
            mark_touched(self.clone());
        }
    }

    pub(crate) fn after_change(&self, root: &Mozel, changed: &[String]) {
        let mut candidates = self.pattern.resolve(root, changed);
        {
            let baselines = self.baselines.lock();
            for known in baselines.keys() {
                if related(known, changed) && !candidates.contains(known) {
                    candidates.push(known.clone());
                }
            }
        }
        let current: Vec<_> = candidates
            .into_iter()
            .map(|p| {
                let value = self.snapshot(root, &p);
                (p, value)
            })
            .collect();

        let mut fired = Vec::new();
        {
            let mut baselines = self.baselines.lock();
            for (p, new_value) in current {
                let old_value = baselines.get(&p).cloned().flatten();
                if new_value != old_value {
                    fired.push(PathChange {
                        path: path::join(&p),
                        new_value: new_value.clone(),
                        old_value,
                    });
                }
                baselines.insert(p, new_value);
            }
        }
        for change in &fired {
            (self.handler)(change);
        }
    }

    pub(crate) fn fire_immediate(&self, root: &Mozel) {
        for p in self.pattern.resolve(root, &[]) {
            if let Some(value) = self.snapshot(root, &p) {
                (self.handler)(&PathChange {
                    path: path::join(&p),
                    new_value: Some(value),
                    old_value: None,
                });
            }
        }
    }
}

impl std::fmt::Debug for PathChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathChangeWatcher")
            .field("pattern", &self.pattern.to_string())
            .field("options", &self.options)
            .finish()
    }
}
