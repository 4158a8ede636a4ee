//! # Interval operations for Range
//!
//! Byte ranges show up all over the memory layer: staged writes,
//! transfer chunks and file images are all half-open `start..end`
//! intervals. This module extends [`Range`] with the little bit of
//! interval math needed to merge and split them.

use std::ops::Range;

/// Interval math on half-open ranges.
pub trait Interval: PartialEq + Sized {
    /// The underlying numerical type.
    type Element: Copy + Ord;

    /// Return the intersection of two intervals.
    fn intersection(&self, other: &Self) -> Self;

    /// Return true, if `other` is completely contained within the
    /// interval.
    fn contains_interval(&self, other: &Self) -> bool;

    /// Return true, if the two intervals have overlapping parts.
    fn overlaps(&self, other: &Self) -> bool;

    /// Return true, if the two intervals overlap or one ends exactly
    /// where the other starts.
    ///
    /// Two touching intervals can be replaced by their [hull](Interval::hull)
    /// without covering any element that was not covered before.
    fn touches(&self, other: &Self) -> bool;

    /// Return the smallest interval covering both intervals.
    fn hull(&self, other: &Self) -> Self;
}

impl<T: Copy + Ord + Default> Interval for Range<T> {
    type Element = T;

    fn intersection(&self, other: &Self) -> Self {
        self.start.max(other.start)..self.end.min(other.end)
    }

    fn contains_interval(&self, other: &Self) -> bool {
        self.intersection(other) == *other
    }

    fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty() && !self.intersection(other).is_empty()
    }

    fn touches(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start <= other.end
            && other.start <= self.end
    }

    fn hull(&self, other: &Self) -> Self {
        self.start.min(other.start)..self.end.max(other.end)
    }
}
