//! Dirty-range tracking
//!
//! A [`DirtyRangeSet`] records which host indices were written since the
//! last host-to-device synchronization. The set is kept as the minimal cover
//! of those indices: after every insertion no two ranges overlap or touch,
//! and ranges are ordered by start.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Half-open interval `[start, end)` of element indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct DirtyRange {
    start: usize,
    end: usize,
}

/// Unvalidated wire form of [`DirtyRange`]
#[derive(Deserialize)]
struct RawRange {
    start: usize,
    end: usize,
}

impl TryFrom<RawRange> for DirtyRange {
    type Error = Error;

    fn try_from(raw: RawRange) -> Result<Self> {
        DirtyRange::new(raw.start, raw.end)
    }
}

impl DirtyRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start > end {
            return Err(Error::invalid_range(start, end, end));
        }
        Ok(Self { start, end })
    }

    /// Range covering a single index
    ///
    /// Fails for `usize::MAX`, whose exclusive end is not representable.
    #[inline]
    pub fn single(index: usize) -> Result<Self> {
        let end = index
            .checked_add(1)
            .ok_or_else(|| Error::out_of_bounds(index, usize::MAX))?;
        Ok(Self { start: index, end })
    }

    /// Start index (inclusive)
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// End index (exclusive)
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of indices covered
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True when no index is covered
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True when `index` lies inside the range
    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    /// True when the two ranges share at least one index
    #[inline]
    pub fn overlaps(&self, other: &DirtyRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when one range ends exactly where the other starts
    #[inline]
    pub fn adjacent(&self, other: &DirtyRange) -> bool {
        self.end == other.start || other.end == self.start
    }

    /// Smallest range covering both
    #[inline]
    pub fn merge(&self, other: &DirtyRange) -> DirtyRange {
        DirtyRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Convert to a std range for slicing
    #[inline]
    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }

    fn mergeable(&self, other: &DirtyRange) -> bool {
        self.overlaps(other) || self.adjacent(other)
    }
}

impl From<DirtyRange> for Range<usize> {
    fn from(range: DirtyRange) -> Self {
        range.as_range()
    }
}

impl std::fmt::Display for DirtyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Minimal, ordered, disjoint and non-adjacent set of dirty ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyRangeSet {
    ranges: Vec<DirtyRange>,
}

impl DirtyRangeSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a range, merging it with every range it overlaps or touches
    ///
    /// Empty ranges are ignored.
    pub fn insert(&mut self, range: DirtyRange) {
        if range.is_empty() {
            return;
        }

        match self.ranges.iter_mut().find(|r| r.mergeable(&range)) {
            Some(existing) => *existing = existing.merge(&range),
            None => self.ranges.push(range),
        }

        self.compact();
    }

    /// Merge pairs until no two ranges overlap or touch
    fn compact(&mut self) {
        if self.ranges.len() < 2 {
            return;
        }

        self.ranges.sort_unstable_by_key(|r| r.start);

        let mut merged: Vec<DirtyRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.mergeable(&range) => *last = last.merge(&range),
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    /// Remove every range
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Clip every range to `[0, end)`, dropping ranges that fall outside
    pub fn truncate(&mut self, end: usize) {
        self.ranges.retain_mut(|r| {
            r.end = r.end.min(end);
            r.start < r.end
        });
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True when nothing is dirty
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of dirty indices
    pub fn covered(&self) -> usize {
        self.ranges.iter().map(DirtyRange::len).sum()
    }

    /// True when `index` is inside some dirty range
    pub fn contains(&self, index: usize) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if r.end <= index {
                    std::cmp::Ordering::Less
                } else if r.start > index {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Iterate ranges in ascending order
    pub fn iter(&self) -> std::slice::Iter<'_, DirtyRange> {
        self.ranges.iter()
    }

    /// Ranges as a slice
    pub fn as_slice(&self) -> &[DirtyRange] {
        &self.ranges
    }
}

impl<'a> IntoIterator for &'a DirtyRangeSet {
    type Item = &'a DirtyRange;
    type IntoIter = std::slice::Iter<'a, DirtyRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_range() -> impl Strategy<Value = (usize, usize)> {
        (0usize..200, 0usize..16).prop_map(|(start, len)| (start, start + len))
    }

    proptest! {
        /// Property: no two ranges overlap or touch after any insertion order
        #[test]
        fn set_is_minimal(inputs in prop::collection::vec(arb_range(), 0..64)) {
            let mut set = DirtyRangeSet::new();
            for (start, end) in &inputs {
                set.insert(DirtyRange::new(*start, *end).unwrap());
            }

            for pair in set.as_slice().windows(2) {
                prop_assert!(pair[0].end() < pair[1].start());
            }
            for r in &set {
                prop_assert!(!r.is_empty());
            }
        }

        /// Property: the set covers exactly the union of marked indices
        #[test]
        fn set_covers_union(inputs in prop::collection::vec(arb_range(), 0..64)) {
            let mut set = DirtyRangeSet::new();
            let mut marked = [false; 216];
            for (start, end) in &inputs {
                set.insert(DirtyRange::new(*start, *end).unwrap());
                for flag in &mut marked[*start..*end] {
                    *flag = true;
                }
            }

            for (index, flag) in marked.iter().enumerate() {
                prop_assert_eq!(set.contains(index), *flag);
            }
            prop_assert_eq!(set.covered(), marked.iter().filter(|f| **f).count());
        }
    }
}
