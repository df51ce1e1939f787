//! Key-space abstractions.
//!
//! The engine never interprets keys itself. Partitions store keys as opaque
//! serialized strings; the caller supplies a [`KeySerializer`] to convert
//! between its key type and that representation, and a [`KeyArithmetics`] to
//! order keys and choose split points.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::range::{Range, RangeSplit};

/// Ordering and splitting rules for a key type.
pub trait KeyArithmetics<K>: Send + Sync {
    /// Compares two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;

    /// Cuts the unprocessed part of `range` in two.
    ///
    /// `position` is the last key already processed, if any. The split key is
    /// strictly greater than `position`, so the lower half always retains the
    /// processed prefix. Returns `None` when fewer than two unprocessed keys
    /// remain.
    fn split(&self, range: &Range<K>, position: Option<&K>) -> Option<RangeSplit<K>>;
}

/// Conversion between keys and their persisted string form.
pub trait KeySerializer<K>: Send + Sync {
    /// Serializes a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the key cannot be represented.
    fn serialize(&self, key: &K) -> Result<String>;

    /// Deserializes a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if `value` is not a valid key.
    fn deserialize(&self, value: &str) -> Result<K>;
}

/// Arithmetics for dense `i64` key spaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int64KeyArithmetics;

impl KeyArithmetics<i64> for Int64KeyArithmetics {
    fn compare(&self, a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn split(&self, range: &Range<i64>, position: Option<&i64>) -> Option<RangeSplit<i64>> {
        // Widen to avoid overflow at the edges of the i64 domain.
        let first = i128::from(range.first);
        let start = match position {
            Some(p) => (i128::from(*p) + 1).max(first),
            None => first,
        };
        let end = if range.inclusive {
            i128::from(range.last)
        } else {
            i128::from(range.last) - 1
        };

        if end - start < 1 {
            return None;
        }

        let middle = start + (end - start + 1) / 2;
        let middle = i64::try_from(middle).ok()?;

        Some(RangeSplit {
            lower: Range::new(range.first, middle, false),
            upper: Range::new(middle, range.last, range.inclusive),
        })
    }
}

/// Serializes `i64` keys as decimal strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int64KeySerializer;

impl KeySerializer<i64> for Int64KeySerializer {
    fn serialize(&self, key: &i64) -> Result<String> {
        Ok(key.to_string())
    }

    fn deserialize(&self, value: &str) -> Result<i64> {
        value
            .parse()
            .map_err(|e| Error::serialization(format!("invalid i64 key '{value}': {e}")))
    }
}

/// Stores string keys as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKeySerializer;

impl KeySerializer<String> for StringKeySerializer {
    fn serialize(&self, key: &String) -> Result<String> {
        Ok(key.clone())
    }

    fn deserialize(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}
