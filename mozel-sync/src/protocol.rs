//! Sync protocol messages.
//!
//! The exchange is push based:
//! 1. A connecting peer announces itself with `connection`
//! 2. It receives the full state of every tracked entity (`full-state`)
//! 3. Afterwards both sides `push` commit batches as they are produced and
//!    relay what they merged to their other peers
//!
//! Messages are JSON objects tagged by their `event` field.

use crate::commit::CommitBatch;
use mozel_types::SyncId;
use serde::{Deserialize, Serialize};

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncMessage {
    /// Handshake sent by a connecting peer.
    Connection {
        #[serde(rename = "syncID")]
        sync_id: SyncId,
    },

    /// Full states of every entity, sent in response to `connection` or
    /// after an outdated update.
    FullState { commits: CommitBatch },

    /// Incremental commits.
    Push { commits: CommitBatch },
}

impl SyncMessage {
    pub fn connection(sync_id: SyncId) -> Self {
        Self::Connection { sync_id }
    }

    pub fn full_state(commits: CommitBatch) -> Self {
        Self::FullState { commits }
    }

    pub fn push(commits: CommitBatch) -> Self {
        Self::Push { commits }
    }

    /// Returns the message type as a string (for logging).
    pub fn event(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::FullState { .. } => "full-state",
            Self::Push { .. } => "push",
        }
    }
}
