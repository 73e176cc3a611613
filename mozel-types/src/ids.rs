//! Identifier types used throughout the mozel crates.
//!
//! Entity gids are alphanumeric: peers written against the JSON wire format
//! may send them either as numbers or as strings, so deserialization accepts
//! both. Sync ids are random UUID v4 strings.

use crate::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of an entity within one registry.
///
/// A gid is either numeric (auto-assigned by the registry) or an arbitrary
/// alphanumeric label chosen by the caller (`-` and `_` are also allowed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gid(String);

impl Gid {
    /// Parses a gid from a string, rejecting empty or non-alphanumeric input.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let valid = !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::InvalidGid(s.to_string()))
        }
    }

    /// Creates a numeric gid.
    #[must_use]
    pub fn from_number(n: u64) -> Self {
        Self(n.to_string())
    }

    /// Returns the numeric value if this gid is purely numeric.
    #[must_use]
    pub fn as_number(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Returns the gid as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Gid {
    fn from(n: u64) -> Self {
        Self::from_number(n)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Gid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Gid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawGid {
    Number(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for Gid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawGid::deserialize(deserializer)? {
            RawGid::Number(n) => Ok(Self::from_number(n)),
            RawGid::Text(s) => Self::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// Identity of a sync instance (one peer in the sync network).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(String);

impl SyncId {
    /// Creates a new random sync ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the sync ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SyncId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SyncId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
