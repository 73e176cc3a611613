//! Commit/merge state synchronization for mozel entity trees.
//!
//! # Architecture
//!
//! Every tracked entity gets a [`MozelWatcher`] that coalesces local
//! property changes and turns them into versioned [`Commit`]s. A
//! [`MozelSync`] coordinates the watchers of one process: it mirrors a
//! [`mozel_model::Registry`], produces commit batches and merges batches
//! received from peers.
//!
//! ## Conflict resolution
//!
//! All peers share one version line per entity. A commit carries the version
//! it was based on; the receiver compares it with the commits it recorded
//! after that version. Where both touched the same property, the higher
//! priority wins, then the higher version, then the greater sync id. The
//! losing properties are stripped from the commit before it is applied and
//! relayed, so every peer converges on the same values.
//!
//! History is bounded. A commit based on a version that has left the window
//! fails with [`OutdatedUpdateError`] and has to be followed by a full state.
//!
//! # Example
//!
//! ```
//! use mozel_model::{EntitySchema, PropertyDef, Registry};
//! use mozel_sync::{MozelSync, SyncConfig};
//! use serde_json::json;
//!
//! let registry = Registry::new();
//! registry.define(EntitySchema::new("note").with(PropertyDef::data("title")));
//!
//! let sync = MozelSync::new(SyncConfig::default());
//! sync.sync_registry(&registry)?;
//! sync.start();
//!
//! let note = registry.create("note", json!({ "title": "draft" }))?;
//! note.set("title", json!("final"))?;
//!
//! let batch = sync.commit();
//! assert_eq!(batch[note.gid()].changes["title"], json!("final"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod codec;
mod commit;
mod config;
mod error;
mod history;
pub mod protocol;
mod sync;
mod watcher;

pub use commit::{Changes, Commit, CommitBatch};
pub use config::{DEFAULT_HISTORY_MAX_LENGTH, SyncConfig, WatcherOptions};
pub use error::{OutdatedUpdateError, SyncError, SyncResult};
pub use history::HistoryEntry;
pub use protocol::SyncMessage;
pub use sync::{MergeReport, MozelSync};
pub use watcher::{ChangeListener, MozelWatcher};
