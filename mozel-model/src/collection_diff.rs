//! Ordered-collection mutation diffing.
//!
//! Compares two item sequences position by position and uses per-value
//! occurrence counts to tell a reshuffle (same multiset) apart from a genuine
//! insertion or removal. Positions in `added`/`removed` are only exact for
//! single-element operations; a multi-element splice is reported with the
//! correct items but approximate indices.

use std::collections::HashMap;
use std::hash::Hash;

/// A position whose value differs between `before` and `after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub index: usize,
    pub before: Option<T>,
    pub after: Option<T>,
}

/// An item that entered or left the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation<T> {
    pub index: usize,
    pub item: T,
}

/// The result of [`diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMutations<T> {
    pub changed: Vec<Change<T>>,
    pub added: Vec<Mutation<T>>,
    pub removed: Vec<Mutation<T>>,
}

impl<T> CollectionMutations<T> {
    /// Returns true if nothing differs.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

fn counts<T: Eq + Hash>(items: &[T]) -> HashMap<&T, usize> {
    let mut counts = HashMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    counts
}

/// Computes the mutations that turn `before` into `after`.
pub fn diff<T: Eq + Hash + Clone>(before: &[T], after: &[T]) -> CollectionMutations<T> {
    let before_counts = counts(before);
    let after_counts = counts(after);

    // Occurrences that exist only on one side; each one is reported once.
    let mut surplus_added: HashMap<&T, usize> = after_counts
        .iter()
        .filter_map(|(item, &n)| {
            let had = before_counts.get(item).copied().unwrap_or(0);
            (n > had).then_some((*item, n - had))
        })
        .collect();
    let mut surplus_removed: HashMap<&T, usize> = before_counts
        .iter()
        .filter_map(|(item, &n)| {
            let has = after_counts.get(item).copied().unwrap_or(0);
            (n > has).then_some((*item, n - has))
        })
        .collect();

    let mut result = CollectionMutations {
        changed: Vec::new(),
        added: Vec::new(),
        removed: Vec::new(),
    };

    for index in 0..before.len().max(after.len()) {
        let old = before.get(index);
        let new = after.get(index);
        if old == new {
            continue;
        }
        result.changed.push(Change {
            index,
            before: old.cloned(),
            after: new.cloned(),
        });
        if let Some(item) = new {
            if let Some(n) = surplus_added.get_mut(item).filter(|n| **n > 0) {
                *n -= 1;
                result.added.push(Mutation {
                    index,
                    item: item.clone(),
                });
            }
        }
        if let Some(item) = old {
            if let Some(n) = surplus_removed.get_mut(item).filter(|n| **n > 0) {
                *n -= 1;
                result.removed.push(Mutation {
                    index,
                    item: item.clone(),
                });
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sequences_have_no_mutations() {
        let m = diff(&["a", "b"], &["a", "b"]);
        assert!(m.is_empty());
        assert!(m.added.is_empty());
        assert!(m.removed.is_empty());
    }

    #[test]
    fn duplicate_append_is_added_once() {
        let m = diff(&["a"], &["a", "a"]);
        assert_eq!(m.added, vec![Mutation { index: 1, item: "a" }]);
        assert!(m.removed.is_empty());
    }
}
