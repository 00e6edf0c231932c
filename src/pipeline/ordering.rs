//! Comparator composition for terminal sorting
//!
//! A [`SortSpec`] pairs a key extractor with a direction; a slice of
//! them composes into a single total-order comparator evaluated left to
//! right with the first non-equal comparison winning. Purely sequential,
//! used only by the materializing collector after the pipeline has
//! drained.

use std::cmp::Ordering;

/// Sort direction for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One (key extractor, direction) pair of a composed sort order
pub struct SortSpec<T> {
    compare_fn: Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
    direction: Direction,
}

impl<T> SortSpec<T> {
    /// Ascending order under `key_fn`
    pub fn asc<K, F>(key_fn: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            compare_fn: Box::new(move |a, b| key_fn(a).cmp(&key_fn(b))),
            direction: Direction::Ascending,
        }
    }

    /// Descending order under `key_fn`
    pub fn desc<K, F>(key_fn: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            compare_fn: Box::new(move |a, b| key_fn(b).cmp(&key_fn(a))),
            direction: Direction::Descending,
        }
    }

    /// Compare two items under this spec alone
    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.compare_fn)(a, b)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Compare two items under a composed spec list
///
/// Specs are evaluated left to right and the first non-equal comparison
/// wins; an empty list compares everything equal.
pub fn compare_by_specs<T>(specs: &[SortSpec<T>], a: &T, b: &T) -> Ordering {
    for spec in specs {
        match spec.compare(a, b) {
            Ordering::Equal => continue,
            decided => return decided,
        }
    }
    Ordering::Equal
}

/// Sort a sequence in place under a composed spec list
///
/// A no-op for an empty spec list or sequence. The sort is unstable;
/// items comparing equal under every spec keep an arbitrary relative
/// order.
pub fn sort_by_specs<T>(data: &mut [T], specs: &[SortSpec<T>]) {
    if specs.is_empty() || data.is_empty() {
        return;
    }
    data.sort_unstable_by(|a, b| compare_by_specs(specs, a, b));
}
