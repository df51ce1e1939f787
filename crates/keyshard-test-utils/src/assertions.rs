//! Custom assertion helpers for integration tests.

use std::collections::BTreeMap;
use std::fmt::Debug;

use keyshard_core::Range;
use keyshard_engine::error::Result;
use keyshard_engine::partition::Partition;

/// Converts partitions to `[start, end)` intervals over `i64` keys, sorted.
fn intervals(partitions: &[Partition]) -> Vec<(i128, i128)> {
    let mut intervals: Vec<(i128, i128)> = partitions
        .iter()
        .map(|p| {
            let first: i64 = p.first.parse().expect("numeric first key");
            let last: i64 = p.last.parse().expect("numeric last key");
            (
                i128::from(first),
                i128::from(last) + i128::from(p.is_inclusive),
            )
        })
        .collect();
    intervals.sort_unstable();
    intervals
}

/// Asserts that `partitions` cover `range` exactly: no gaps, no overlaps.
///
/// # Panics
///
/// Panics if a key of `range` is uncovered or covered twice, or if a
/// partition reaches outside `range`.
pub fn assert_exact_cover(partitions: &[Partition], range: &Range<i64>) {
    assert!(!partitions.is_empty(), "Expected at least one partition");
    let intervals = intervals(partitions);

    let start = i128::from(range.first);
    let end = i128::from(range.last) + i128::from(range.inclusive);

    assert_eq!(
        intervals[0].0, start,
        "Coverage starts at {} instead of {start}",
        intervals[0].0
    );
    for pair in intervals.windows(2) {
        let (_, previous_end) = pair[0];
        let (next_start, _) = pair[1];
        assert!(
            next_start >= previous_end,
            "Partitions overlap: one ends at {previous_end}, the next starts at {next_start}"
        );
        assert!(
            next_start <= previous_end,
            "Gap between {previous_end} and {next_start}"
        );
    }
    let last_end = intervals[intervals.len() - 1].1;
    assert_eq!(last_end, end, "Coverage ends at {last_end} instead of {end}");
}

/// Asserts that every key of `range` was processed exactly once.
///
/// # Panics
///
/// Panics if a key is missing, repeated, or outside `range`.
pub fn assert_processed_exactly_once(seen: &BTreeMap<i64, u32>, range: &Range<i64>) {
    assert_processed_at_least_once(seen, range);
    let repeated: Vec<_> = seen.iter().filter(|(_, count)| **count > 1).collect();
    assert!(repeated.is_empty(), "Keys processed more than once: {repeated:?}");
}

/// Asserts that every key of `range`, and nothing else, was processed.
///
/// # Panics
///
/// Panics if a key is missing or outside `range`.
pub fn assert_processed_at_least_once(seen: &BTreeMap<i64, u32>, range: &Range<i64>) {
    let end = if range.inclusive {
        range.last
    } else {
        range.last - 1
    };
    for key in range.first..=end {
        assert!(seen.contains_key(&key), "Key {key} was never processed");
    }
    let outside: Vec<_> = seen
        .keys()
        .filter(|key| !range.contains(key, i64::cmp))
        .collect();
    assert!(outside.is_empty(), "Keys outside the range were processed: {outside:?}");
}

/// Asserts that every partition is completed with nothing remaining.
///
/// # Panics
///
/// Panics if any partition is still open.
pub fn assert_all_completed(partitions: &[Partition]) {
    for partition in partitions {
        assert!(
            partition.is_completed,
            "Partition {} [{}, {}] is not completed",
            partition.id, partition.first, partition.last
        );
        assert_eq!(partition.remaining, 0, "Completed partition has remaining keys");
        assert!(
            partition.split_requester.is_none(),
            "Completed partition still carries a split request"
        );
    }
}

/// Asserts that a result failed with a lock conflict.
///
/// # Panics
///
/// Panics if the result succeeded or failed with another error.
pub fn assert_lock_conflict<T: Debug>(result: &Result<T>) {
    match result {
        Err(err) if err.is_lock_conflict() => {}
        other => panic!("Expected LockConflict, got {other:?}"),
    }
}

/// Asserts that a result failed with an unknown identifier.
///
/// # Panics
///
/// Panics if the result succeeded or failed with another error.
pub fn assert_unknown_identifier<T: Debug>(result: &Result<T>) {
    match result {
        Err(err) if err.is_unknown_identifier() => {}
        other => panic!("Expected UnknownIdentifier, got {other:?}"),
    }
}
