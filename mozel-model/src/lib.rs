//! Typed entity model for mozel.
//!
//! Defines the entity tree the sync engine watches and mutates:
//! - [`EntitySchema`]: declares an entity type's properties (data, child
//!   entities, references, collections)
//! - [`Registry`]: explicit service owning every live entity by gid
//! - [`Mozel`]: handle to one entity; read, export, mutate, watch
//! - [`PathChangeWatcher`]: path-pattern change detection (`dog.*.name`)
//! - [`collection_diff`]: added/removed/changed mutations between two
//!   ordered sequences
//!
//! Validation and coercion beyond the property kind are out of scope: any
//! JSON is accepted for a data property.

pub mod collection_diff;
mod error;
mod mozel;
pub mod path;
mod registry;
mod schema;
mod watcher;

pub use collection_diff::{Change, CollectionMutations, Mutation};
pub use error::{ModelError, ModelResult};
pub use mozel::{DestroyListener, Item, Mozel, Node, gid_of, gid_ref};
pub use path::{PathPattern, Segment};
pub use registry::{ListenerId, Registry, RegistryEvent, RegistryListener};
pub use schema::{EntitySchema, ItemKind, PropertyDef, PropertyKind};
pub use watcher::{PathChange, PathChangeWatcher, WatchHandler, WatchId, WatchOptions};
