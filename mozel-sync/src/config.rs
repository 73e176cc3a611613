//! Sync configuration.

use mozel_types::SyncId;
use std::time::Duration;

/// Default number of versions a watcher keeps in its history window.
pub const DEFAULT_HISTORY_MAX_LENGTH: usize = 20;

/// Configuration for a [`crate::MozelSync`] instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this instance; a random one is generated when `None`.
    pub sync_id: Option<SyncId>,
    /// Conflict tie-break weight. Higher wins.
    pub priority: i64,
    /// History window of every watcher, in versions.
    pub history_max_length: usize,
    /// Commit automatically this long after the first local change.
    pub auto_commit: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_id: None,
            priority: 0,
            history_max_length: DEFAULT_HISTORY_MAX_LENGTH,
            auto_commit: None,
        }
    }
}

/// Configuration for a single [`crate::MozelWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub sync_id: SyncId,
    pub priority: i64,
    pub history_max_length: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            sync_id: SyncId::new(),
            priority: 0,
            history_max_length: DEFAULT_HISTORY_MAX_LENGTH,
        }
    }
}
