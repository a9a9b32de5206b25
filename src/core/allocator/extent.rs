//! Free-run index for bitmap allocators
//!
//! Tracks the free runs ("fragments") that sit below a bitmap's untouched
//! tail. Runs are indexed twice: by start, for coalescing with neighbours,
//! and by length, for best-fit lookup.

use std::collections::BTreeMap;

/// A contiguous range of bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First bit of the range
    pub start: usize,
    /// Number of bits in the range
    pub length: usize,
}

impl Extent {
    pub fn new(start: usize, length: usize) -> Self {
        Extent { start, length }
    }

    /// One past the last bit
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end()
    }

    /// True when the two ranges touch without overlapping
    pub fn is_adjacent(&self, other: &Extent) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    pub fn coalesce(&self, other: &Extent) -> Option<Extent> {
        if !self.is_adjacent(other) {
            return None;
        }
        let start = self.start.min(other.start);
        Some(Extent::new(start, self.end().max(other.end()) - start))
    }
}

/// Free runs keyed by start, with a secondary length → starts index
#[derive(Debug, Clone, Default)]
pub struct FragmentList {
    by_start: BTreeMap<usize, usize>,
    by_length: BTreeMap<usize, Vec<usize>>,
}

impl FragmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked runs
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Total free bits across all runs
    pub fn total(&self) -> usize {
        self.by_start.values().sum()
    }

    /// Runs in start order
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_start
            .iter()
            .map(|(&start, &length)| Extent::new(start, length))
    }

    /// Insert a run, merging it with any neighbour it touches. Returns the
    /// merged run.
    pub fn insert(&mut self, extent: Extent) -> Extent {
        let mut merged = extent;

        if let Some((&start, &length)) = self.by_start.range(..extent.start).next_back() {
            let prev = Extent::new(start, length);
            if let Some(joined) = prev.coalesce(&merged) {
                self.remove(start);
                merged = joined;
            }
        }

        if let Some(&length) = self.by_start.get(&merged.end()) {
            let next = Extent::new(merged.end(), length);
            if let Some(joined) = merged.coalesce(&next) {
                self.remove(next.start);
                merged = joined;
            }
        }

        self.insert_raw(merged);
        merged
    }

    /// Remove the run starting at `start`
    pub fn remove(&mut self, start: usize) -> Option<Extent> {
        let length = self.by_start.remove(&start)?;
        if let Some(starts) = self.by_length.get_mut(&length) {
            if let Some(pos) = starts.iter().rposition(|&s| s == start) {
                starts.remove(pos);
            }
            if starts.is_empty() {
                self.by_length.remove(&length);
            }
        }
        Some(Extent::new(start, length))
    }

    /// Smallest run that can hold `length` bits; among equal lengths the
    /// most recently indexed one
    pub fn best_fit(&self, length: usize) -> Option<Extent> {
        let (&run_length, starts) = self.by_length.range(length..).next()?;
        let start = *starts.last()?;
        Some(Extent::new(start, run_length))
    }

    /// Run containing `index`, if any
    pub fn containing(&self, index: usize) -> Option<Extent> {
        let (&start, &length) = self.by_start.range(..=index).next_back()?;
        let extent = Extent::new(start, length);
        extent.contains(index).then_some(extent)
    }

    /// Run with the highest start
    pub fn last(&self) -> Option<Extent> {
        self.by_start
            .iter()
            .next_back()
            .map(|(&start, &length)| Extent::new(start, length))
    }

    /// Take `[start, start + length)` out of the run that contains it,
    /// keeping whatever is left on either side
    pub fn carve(&mut self, start: usize, length: usize) -> bool {
        let Some(run) = self.containing(start) else {
            return false;
        };
        if start + length > run.end() {
            return false;
        }
        self.remove(run.start);
        if start > run.start {
            self.insert_raw(Extent::new(run.start, start - run.start));
        }
        if start + length < run.end() {
            self.insert_raw(Extent::new(start + length, run.end() - start - length));
        }
        true
    }

    pub fn clear(&mut self) {
        self.by_start.clear();
        self.by_length.clear();
    }

    fn insert_raw(&mut self, extent: Extent) {
        if extent.length == 0 {
            return;
        }
        self.by_start.insert(extent.start, extent.length);
        self.by_length
            .entry(extent.length)
            .or_default()
            .push(extent.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_adjacency() {
        let a = Extent::new(0, 4);
        let b = Extent::new(4, 2);
        let c = Extent::new(7, 1);

        assert!(a.is_adjacent(&b));
        assert!(!a.is_adjacent(&c));
        assert_eq!(a.coalesce(&b), Some(Extent::new(0, 6)));
        assert_eq!(a.coalesce(&c), None);
    }

    #[test]
    fn test_insert_merges_both_sides() {
        let mut list = FragmentList::new();
        list.insert(Extent::new(0, 2));
        list.insert(Extent::new(5, 3));
        assert_eq!(list.len(), 2);

        let merged = list.insert(Extent::new(2, 3));
        assert_eq!(merged, Extent::new(0, 8));
        assert_eq!(list.len(), 1);
        assert_eq!(list.best_fit(8), Some(Extent::new(0, 8)));
        assert_eq!(list.best_fit(3), Some(Extent::new(0, 8)));
    }

    #[test]
    fn test_best_fit_prefers_smallest() {
        let mut list = FragmentList::new();
        list.insert(Extent::new(0, 10));
        list.insert(Extent::new(20, 3));
        list.insert(Extent::new(30, 5));

        assert_eq!(list.best_fit(3), Some(Extent::new(20, 3)));
        assert_eq!(list.best_fit(4), Some(Extent::new(30, 5)));
        assert_eq!(list.best_fit(6), Some(Extent::new(0, 10)));
        assert_eq!(list.best_fit(11), None);
    }

    #[test]
    fn test_carve_splits_run() {
        let mut list = FragmentList::new();
        list.insert(Extent::new(10, 10));

        assert!(list.carve(13, 4));
        let runs: Vec<_> = list.iter().collect();
        assert_eq!(runs, vec![Extent::new(10, 3), Extent::new(17, 3)]);
        assert_eq!(list.total(), 6);

        assert!(!list.carve(16, 1));
        assert!(!list.carve(18, 5));
    }

    #[test]
    fn test_remove_cleans_length_index() {
        let mut list = FragmentList::new();
        list.insert(Extent::new(0, 2));
        list.insert(Extent::new(10, 2));

        assert_eq!(list.remove(10), Some(Extent::new(10, 2)));
        assert_eq!(list.best_fit(2), Some(Extent::new(0, 2)));
        assert_eq!(list.remove(0), Some(Extent::new(0, 2)));
        assert_eq!(list.best_fit(1), None);
        assert!(list.is_empty());
    }
}
