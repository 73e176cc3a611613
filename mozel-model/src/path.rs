//! Dot-separated paths and path patterns.
//!
//! A pattern is parsed once into segment matchers; matching a changed path
//! never re-splits the pattern string.

use crate::error::{ModelError, ModelResult};
use crate::mozel::{Mozel, Node};
use std::fmt;
use std::str::FromStr;

/// Splits a dot-separated path into its segments. The empty path is the root.
pub fn split(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    path.split('.').map(str::to_string).collect()
}

/// Joins path segments with dots.
pub fn join(segments: &[String]) -> String {
    segments.join(".")
}

/// One segment of a [`PathPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `*`: any key or index.
    Wildcard,
}

impl Segment {
    fn matches(&self, part: &str) -> bool {
        match self {
            Self::Literal(s) => s == part,
            Self::Wildcard => true,
        }
    }
}

/// A parsed, immutable path pattern such as `dog.*.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parses a pattern. Empty segments (`a..b`, trailing dots) are rejected.
    pub fn parse(pattern: &str) -> ModelResult<Self> {
        let parts = split(pattern);
        if parts.iter().any(String::is_empty) {
            return Err(ModelError::InvalidPath(pattern.to_string()));
        }
        let segments = parts
            .into_iter()
            .map(|p| {
                if p == "*" {
                    Segment::Wildcard
                } else {
                    Segment::Literal(p)
                }
            })
            .collect();
        Ok(Self { segments })
    }

    /// Returns the parsed segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root pattern.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Decides whether a change at `changed` concerns this pattern.
    ///
    /// A longer changed path (a descendant) only matches when `deep`; a
    /// shorter one (an ancestor) matches when it agrees with the pattern's
    /// prefix. Overlapping segments are compared one by one, `*` matching any.
    pub fn matches(&self, changed: &[String], deep: bool) -> bool {
        if self.segments.len() < changed.len() && !deep {
            return false;
        }
        self.segments
            .iter()
            .zip(changed)
            .all(|(segment, part)| segment.matches(part))
    }

    /// Resolves the pattern to concrete existing paths under `root`.
    ///
    /// Wildcards are bound to the changed path's segment while the walk is
    /// still on the changed path, and expanded over the existing keys of the
    /// current node otherwise.
    pub(crate) fn resolve(&self, root: &Mozel, changed: &[String]) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        resolve_into(
            &Node::Entity(root.clone()),
            &self.segments,
            changed,
            &mut prefix,
            &mut out,
        );
        out
    }
}

fn resolve_into(
    node: &Node,
    segments: &[Segment],
    changed: &[String],
    prefix: &mut Vec<String>,
    out: &mut Vec<Vec<String>>,
) {
    let Some((first, rest)) = segments.split_first() else {
        out.push(prefix.clone());
        return;
    };
    let depth = prefix.len();
    let on_changed_path = depth < changed.len() && changed[..depth] == prefix[..];
    let keys = match first {
        Segment::Literal(key) => vec![key.clone()],
        Segment::Wildcard if on_changed_path => vec![changed[depth].clone()],
        Segment::Wildcard => node.keys(),
    };
    for key in keys {
        if let Some(child) = node.child(&key) {
            prefix.push(key);
            resolve_into(&child, rest, changed, prefix, out);
            prefix.pop();
        }
    }
}

impl FromStr for PathPattern {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.as_str(),
                Segment::Wildcard => "*",
            })
            .collect();
        f.write_str(&parts.join("."))
    }
}
