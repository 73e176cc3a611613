//! Error types for the entity model.

use mozel_types::Gid;
use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by the entity model.
///
/// These are local-model concerns: the sync layer treats exported values as
/// opaque data and only reports these when applying a remote change fails.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No schema registered for the entity type.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// The entity type has no property with this name.
    #[error("{entity_type} has no property {property:?}")]
    UnknownProperty {
        entity_type: String,
        property: String,
    },

    /// The value does not fit the property kind.
    #[error("property {property:?} expects {expected}")]
    TypeMismatch {
        property: String,
        expected: &'static str,
    },

    /// The entity was destroyed and can no longer be mutated.
    #[error("entity {0} is destroyed")]
    Destroyed(Gid),

    /// A different entity with this gid is already registered.
    #[error("duplicate gid: {0}")]
    DuplicateGid(Gid),

    /// The value could not be interpreted as a gid.
    #[error("invalid gid: {0}")]
    InvalidGid(String),

    /// The path pattern could not be parsed.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// Collection index out of range.
    #[error("index {index} out of range for {property:?} (len {len})")]
    IndexOutOfRange {
        property: String,
        index: usize,
        len: usize,
    },

    /// Assigning the entity would make it its own ancestor.
    #[error("entity {0} cannot own one of its ancestors")]
    OwnershipCycle(Gid),

    /// The registry that created the entity no longer exists.
    #[error("registry dropped")]
    RegistryDropped,
}
