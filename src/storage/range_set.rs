//! Disjoint interval set
//!
//! Tracks byte ranges as half-open `[start, end)` intervals kept sorted,
//! disjoint and never adjacent: touching intervals are always merged.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Ordered set of disjoint half-open `u64` intervals
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// start -> end
    ranges: BTreeMap<u64, u64>,
}

fn normalize(a: u64, b: u64) -> (u64, u64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl RangeSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a list of intervals
    pub fn from_ranges<I: IntoIterator<Item = Range<u64>>>(ranges: I) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.insert(r.start, r.end);
        }
        set
    }

    /// Add `[a, b)`, merging with every overlapping or touching interval.
    pub fn insert(&mut self, a: u64, b: u64) {
        let (mut start, mut end) = normalize(a, b);
        if start == end {
            return;
        }

        // Every stored interval with s <= end and e >= start gets absorbed.
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in absorbed {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }

        self.ranges.insert(start, end);
    }

    /// Remove `[a, b)`, splitting or shrinking the intervals it overlaps.
    pub fn extract(&mut self, a: u64, b: u64) {
        let (start, end) = normalize(a, b);
        if start == end {
            return;
        }

        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    /// True iff a single stored interval covers all of `[a, b)`.
    pub fn contains(&self, a: u64, b: u64) -> bool {
        let (start, end) = normalize(a, b);
        match self.ranges.range(..=start).next_back() {
            Some((_, &e)) => e >= end && (e > start || start == end),
            None => false,
        }
    }

    /// Stored intervals that overlap `[a, b)`, in ascending order.
    pub fn find_intersections(&self, a: u64, b: u64) -> Vec<Range<u64>> {
        let (start, end) = normalize(a, b);
        if start == end {
            return Vec::new();
        }
        let mut found: Vec<Range<u64>> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|(_, &e)| e > start)
            .map(|(&s, &e)| s..e)
            .collect();
        found.reverse();
        found
    }

    /// Lowest interval, if any
    pub fn first(&self) -> Option<Range<u64>> {
        self.ranges.iter().next().map(|(&s, &e)| s..e)
    }

    /// Remove and return the lowest interval
    pub fn pop_first(&mut self) -> Option<Range<u64>> {
        let (&s, &e) = self.ranges.iter().next()?;
        self.ranges.remove(&s);
        Some(s..e)
    }

    /// True when no range is stored
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of stored intervals
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Sum of the lengths of all stored intervals
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }

    /// Remove every range
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ranges.iter().map(|(s, e)| format!("[{}, {})", s, e)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranges(set: &RangeSet) -> Vec<Range<u64>> {
        set.iter().collect()
    }

    #[test]
    fn test_insert_bridges_neighbors() {
        let mut set = RangeSet::new();
        set.insert(1, 2);
        set.insert(3, 4);
        set.insert(7, 8);
        set.insert(9, 10);
        set.insert(4, 7);
        assert_eq!(ranges(&set), vec![1..2, 3..8, 9..10]);
    }

    #[test]
    fn test_insert_extends_single_neighbor() {
        let mut set = RangeSet::new();
        set.insert(0, 10);
        set.insert(10, 20);
        assert_eq!(ranges(&set), vec![0..20]);

        set.insert(25, 30);
        set.insert(22, 26);
        assert_eq!(ranges(&set), vec![0..20, 22..30]);
    }

    #[test]
    fn test_insert_swallows_many() {
        let mut set = RangeSet::from_ranges(vec![2..3, 5..6, 8..9, 11..12]);
        set.insert(0, 100);
        assert_eq!(ranges(&set), vec![0..100]);
    }

    #[test]
    fn test_insert_reversed_and_empty() {
        let mut set = RangeSet::new();
        set.insert(8, 4);
        assert_eq!(ranges(&set), vec![4..8]);
        set.insert(20, 20);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_extract_splits_interior() {
        let mut set = RangeSet::from_ranges(vec![0..100]);
        set.extract(40, 60);
        assert_eq!(ranges(&set), vec![0..40, 60..100]);
    }

    #[test]
    fn test_extract_whole_interval() {
        let mut set = RangeSet::from_ranges(vec![0..10, 20..30]);
        set.extract(20, 30);
        assert_eq!(ranges(&set), vec![0..10]);
    }

    #[test]
    fn test_extract_spanning_several() {
        let mut set = RangeSet::from_ranges(vec![0..10, 20..30, 40..50, 60..70]);
        set.extract(5, 45);
        assert_eq!(ranges(&set), vec![0..5, 45..50, 60..70]);
    }

    #[test]
    fn test_insert_then_extract_is_empty() {
        let mut set = RangeSet::new();
        set.insert(16384, 32768);
        set.extract(16384, 32768);
        assert!(set.is_empty());
    }

    #[test]
    fn test_contains_single_interval_only() {
        let set = RangeSet::from_ranges(vec![0..10, 12..20]);
        assert!(set.contains(0, 10));
        assert!(set.contains(2, 5));
        assert!(set.contains(12, 20));
        assert!(!set.contains(5, 15));
        assert!(!set.contains(10, 12));
        assert!(!set.contains(15, 25));
        assert!(!RangeSet::new().contains(0, 1));
    }

    #[test]
    fn test_find_intersections() {
        let set = RangeSet::from_ranges(vec![0..10, 20..30, 40..50]);
        assert_eq!(set.find_intersections(5, 25), vec![0..10, 20..30]);
        assert_eq!(set.find_intersections(10, 20), Vec::<Range<u64>>::new());
        assert_eq!(set.find_intersections(45, 1000), vec![40..50]);
    }

    #[test]
    fn test_pop_first_and_covered() {
        let mut set = RangeSet::from_ranges(vec![30..40, 0..10]);
        assert_eq!(set.covered(), 20);
        assert_eq!(set.pop_first(), Some(0..10));
        assert_eq!(set.first(), Some(30..40));
        assert_eq!(set.covered(), 10);
    }

    #[test]
    fn test_iter_len_and_clear() {
        let mut set = RangeSet::from_ranges(vec![20..25, 0..5]);
        assert!(!set.is_empty());
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..5, 20..25]);

        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
        assert_eq!(set.covered(), 0);
    }

    fn assert_canonical(set: &RangeSet) {
        let stored = ranges(set);
        for r in &stored {
            assert!(r.start < r.end, "empty interval {:?}", r);
        }
        for pair in stored.windows(2) {
            assert!(pair[0].end < pair[1].start, "not disjoint or touching: {:?}", pair);
        }
    }

    proptest! {
        #[test]
        fn prop_inserts_stay_canonical(ops in prop::collection::vec((0u64..500, 0u64..40), 1..60)) {
            let mut set = RangeSet::new();
            let mut naive = vec![false; 600];
            for (start, len) in ops {
                set.insert(start, start + len);
                for b in start..start + len {
                    naive[b as usize] = true;
                }
                assert_canonical(&set);
            }
            let covered = naive.iter().filter(|&&b| b).count() as u64;
            prop_assert_eq!(set.covered(), covered);
        }

        #[test]
        fn prop_extract_matches_naive(
            inserts in prop::collection::vec((0u64..500, 1u64..40), 1..30),
            extracts in prop::collection::vec((0u64..500, 1u64..40), 1..30),
        ) {
            let mut set = RangeSet::new();
            let mut naive = vec![false; 600];
            for (start, len) in inserts {
                set.insert(start, start + len);
                for b in start..start + len {
                    naive[b as usize] = true;
                }
            }
            for (start, len) in extracts {
                set.extract(start, start + len);
                for b in start..start + len {
                    naive[b as usize] = false;
                }
                assert_canonical(&set);
            }
            for (i, &present) in naive.iter().enumerate() {
                let i = i as u64;
                prop_assert_eq!(set.contains(i, i + 1), present);
            }
        }
    }
}
