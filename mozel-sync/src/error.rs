//! Error types for the sync layer.

use mozel_model::ModelError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A commit was based on a version older than an entry the local history
/// has already forgotten.
///
/// The diff cannot be reconciled; the sender has to fall back to a full
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "outdated update: base version {base_version} predates forgotten history up to version {required_version}"
)]
pub struct OutdatedUpdateError {
    pub base_version: u64,
    pub required_version: u64,
}

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A commit could not be merged against local history.
    #[error(transparent)]
    Outdated(#[from] OutdatedUpdateError),

    /// Applying changes to the entity model failed.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeds the maximum message size.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// A registry is already mirrored by this sync instance.
    #[error("a registry is already attached")]
    RegistryAlreadyAttached,

    /// The sync instance or watcher was destroyed.
    #[error("destroyed")]
    Destroyed,
}
