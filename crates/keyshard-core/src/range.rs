//! Ordered key ranges.
//!
//! A [`Range`] always includes its `first` key. Whether it includes its `last`
//! key is controlled by the `inclusive` flag, which lets a range be cut in two
//! at any key without leaving a gap or an overlap: the lower half ends
//! exclusively at the split key and the upper half starts at it.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A contiguous range of keys `[first, last]` or `[first, last)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range<K> {
    /// First key of the range (always inclusive).
    pub first: K,
    /// Last key of the range.
    pub last: K,
    /// Whether `last` belongs to the range.
    pub inclusive: bool,
}

impl<K> Range<K> {
    /// Creates a new range.
    #[must_use]
    pub const fn new(first: K, last: K, inclusive: bool) -> Self {
        Self {
            first,
            last,
            inclusive,
        }
    }

    /// Returns true if `key` falls inside this range under the given ordering.
    pub fn contains<F>(&self, key: &K, compare: F) -> bool
    where
        F: Fn(&K, &K) -> Ordering,
    {
        if compare(key, &self.first) == Ordering::Less {
            return false;
        }
        match compare(key, &self.last) {
            Ordering::Less => true,
            Ordering::Equal => self.inclusive,
            Ordering::Greater => false,
        }
    }

    /// Returns true if `first` sorts at or before `last`.
    ///
    /// A range with `first == last` is only non-empty when it is inclusive.
    pub fn is_ascending<F>(&self, compare: F) -> bool
    where
        F: Fn(&K, &K) -> Ordering,
    {
        match compare(&self.first, &self.last) {
            Ordering::Less => true,
            Ordering::Equal => self.inclusive,
            Ordering::Greater => false,
        }
    }

    /// Maps both bounds through `f`, keeping the inclusive flag.
    pub fn try_map<T, E, F>(&self, f: F) -> Result<Range<T>, E>
    where
        F: Fn(&K) -> Result<T, E>,
    {
        Ok(Range {
            first: f(&self.first)?,
            last: f(&self.last)?,
            inclusive: self.inclusive,
        })
    }
}

/// The outcome of cutting a range in two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSplit<K> {
    /// The lower half; keeps the original `first`.
    pub lower: Range<K>,
    /// The upper half; keeps the original `last` and inclusive flag.
    pub upper: Range<K>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn contains_respects_inclusive_flag() {
        let closed = Range::new(1, 10, true);
        let open = Range::new(1, 10, false);

        assert!(closed.contains(&1, cmp));
        assert!(closed.contains(&10, cmp));
        assert!(!closed.contains(&11, cmp));
        assert!(!closed.contains(&0, cmp));

        assert!(open.contains(&9, cmp));
        assert!(!open.contains(&10, cmp));
    }

    #[test]
    fn single_key_range_is_ascending_only_when_inclusive() {
        assert!(Range::new(5, 5, true).is_ascending(cmp));
        assert!(!Range::new(5, 5, false).is_ascending(cmp));
        assert!(!Range::new(6, 5, true).is_ascending(cmp));
    }

    #[test]
    fn try_map_converts_bounds() {
        let range = Range::new(3_i64, 7, false);
        let mapped: Range<String> = range.try_map(|k| Ok::<_, ()>(k.to_string())).unwrap();
        assert_eq!(mapped, Range::new("3".to_string(), "7".to_string(), false));
    }
}
