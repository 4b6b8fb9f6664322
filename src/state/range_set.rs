//! Self-merging set of record-index ranges.
//!
//! Stored as disjoint, non-adjacent half-open intervals keyed by start.
//! Inserting merges with every overlapping or touching neighbour, so
//! `[0, 5)` and `[5, 10)` collapse into `[0, 10)`.

use std::collections::BTreeMap;
use std::ops::{Range, RangeInclusive};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end (exclusive)
    intervals: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the half-open range `[range.start, range.end)`. Empty ranges are ignored.
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        if let Some((&prev_start, &prev_end)) = self.intervals.range(..=start).next_back() {
            if prev_end >= start {
                start = prev_start;
                end = end.max(prev_end);
            }
        }

        let absorbed: Vec<u64> = self
            .intervals
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.intervals.remove(&s) {
                end = end.max(e);
            }
        }

        self.intervals.insert(start, end);
    }

    /// Insert the closed range `[first, last]`.
    pub fn insert_closed(&mut self, range: RangeInclusive<u64>) {
        let (first, last) = range.into_inner();
        if first > last {
            return;
        }
        self.insert(first..last.saturating_add(1));
    }

    pub fn extend(&mut self, other: &RangeSet) {
        for range in other.iter() {
            self.insert(range);
        }
    }

    /// True if every index in `range` is in the set. Empty ranges are always covered.
    pub fn encloses(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        match self.intervals.range(..=range.start).next_back() {
            Some((_, &end)) => end >= range.end,
            None => false,
        }
    }

    /// True if `[0, end)` is fully covered.
    pub fn covers_prefix(&self, end: u64) -> bool {
        self.encloses(0..end)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.encloses(index..index.saturating_add(1))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.intervals.iter().map(|(&s, &e)| s..e)
    }

    pub(crate) fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

impl FromIterator<Range<u64>> for RangeSet {
    fn from_iter<I: IntoIterator<Item = Range<u64>>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}
