//! # Dirty ranges
//!
//! Staged writes are tracked as a sorted list of half-open byte ranges.
//! Inserting a range merges it with every range it overlaps or touches,
//! so the list always is the smallest set of disjoint, non-adjacent
//! ranges covering every written byte.

use std::ops::Range;

use crate::interval::Interval;

/// Sorted set of disjoint, non-adjacent byte ranges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtyRanges {
    ranges: Vec<Range<usize>>,
}

impl DirtyRanges {
    /// Create an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// The ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Return true, if nothing is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Forget all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Mark `range` as dirty.
    pub fn insert(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }

        // All ranges touching the new one form a contiguous run in the
        // sorted list, so a single pass collects them.
        let mut merged = range;
        self.ranges.retain(|existing| {
            if existing.touches(&merged) {
                merged = merged.hull(existing);
                false
            } else {
                true
            }
        });

        let pos = self.ranges.partition_point(|r| r.start < merged.start);
        self.ranges.insert(pos, merged);
    }

    /// Return true, if the byte at `position` is dirty.
    #[must_use]
    pub fn contains(&self, position: usize) -> bool {
        let pos = self.ranges.partition_point(|r| r.end <= position);

        self.ranges
            .get(pos)
            .is_some_and(|r| r.contains(&position))
    }

    /// The parts of `range` that are not dirty, in ascending order.
    #[must_use]
    pub fn clean_parts(&self, range: Range<usize>) -> Vec<Range<usize>> {
        let mut parts = Vec::new();
        let mut cursor = range.start;

        for dirty in self.ranges.iter().filter(|r| r.overlaps(&range)) {
            if cursor < dirty.start {
                parts.push(cursor..dirty.start);
            }
            cursor = cursor.max(dirty.end);
        }

        if cursor < range.end {
            parts.push(cursor..range.end);
        }

        parts
    }
}
