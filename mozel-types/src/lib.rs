//! Identifier types for the mozel data model and its sync engine.
//!
//! This crate defines the identities every other crate agrees on:
//! - [`Gid`]: the alphanumeric identity of an entity within a registry
//! - [`SyncId`]: the identity of one sync instance (a peer)
//!
//! Both serialize as plain JSON strings so they can travel inside commits.

mod ids;

pub use ids::{Gid, SyncId};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid gid: {0:?}")]
    InvalidGid(String),
}
