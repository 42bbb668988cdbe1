//! Volatile and Purgeable Page Ranges
//!
//! A [`PurgeablePageRanges`] tracker is owned by a client of an anonymous
//! VM object (typically one region) and records which pages that client
//! has declared volatile. The object itself treats a page as volatile only
//! when every registered tracker does; purging releases exactly those pages.
//!
//! Ranges are in page-index units relative to the start of the object.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cmp::{max, min};
use spin::{Mutex, MutexGuard};

use crate::vm::vm_object::VmObject;

// ============================================================================
// Volatile Page Range
// ============================================================================

/// A run of pages, optionally marked as having been purged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolatilePageRange {
    pub base: usize,
    pub count: usize,
    pub was_purged: bool,
}

impl VolatilePageRange {
    pub const fn new(base: usize, count: usize) -> Self {
        Self {
            base,
            count,
            was_purged: false,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// One past the last page
    pub const fn range_end(&self) -> usize {
        self.base + self.count
    }

    pub const fn contains(&self, index: usize) -> bool {
        index >= self.base && index < self.range_end()
    }

    pub const fn intersects(&self, other: &VolatilePageRange) -> bool {
        self.base < other.range_end() && other.base < self.range_end()
    }

    /// Overlap of both ranges, keeping this range's purge flag
    pub fn intersected(&self, other: &VolatilePageRange) -> VolatilePageRange {
        let base = max(self.base, other.base);
        let end = min(self.range_end(), other.range_end());
        VolatilePageRange {
            base,
            count: end.saturating_sub(base),
            was_purged: self.was_purged,
        }
    }
}

// ============================================================================
// Volatile Page Ranges
// ============================================================================

/// Sorted, disjoint, non-adjacent set of ranges inside a total range
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolatilePageRanges {
    ranges: Vec<VolatilePageRange>,
    total_range: VolatilePageRange,
}

impl VolatilePageRanges {
    pub fn new(total_range: VolatilePageRange) -> Self {
        Self {
            ranges: Vec::new(),
            total_range,
        }
    }

    pub fn total_range(&self) -> VolatilePageRange {
        self.total_range
    }

    pub fn ranges(&self) -> &[VolatilePageRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Number of pages covered
    pub fn page_count(&self) -> usize {
        self.ranges.iter().map(|r| r.count).sum()
    }

    /// Append a range known to sort after everything already present
    pub fn add_unchecked(&mut self, range: VolatilePageRange) {
        debug_assert!(self.ranges.last().map_or(true, |last| last.range_end() <= range.base));
        if !range.is_empty() {
            self.ranges.push(range);
        }
    }

    /// Add `range`, merging with overlapping or adjacent ranges
    ///
    /// Returns true if any page was not already covered.
    pub fn add(&mut self, range: VolatilePageRange) -> bool {
        let range = range.intersected(&self.total_range);
        if range.is_empty() {
            return false;
        }

        let first = self.ranges.partition_point(|r| r.range_end() < range.base);
        let last = self.ranges.partition_point(|r| r.base <= range.range_end());
        if first < last {
            let covered = self.ranges[first..last]
                .iter()
                .map(|r| r.intersected(&range).count)
                .sum::<usize>();
            let merged_base = min(range.base, self.ranges[first].base);
            let merged_end = max(range.range_end(), self.ranges[last - 1].range_end());
            let was_purged = range.was_purged || self.ranges[first..last].iter().any(|r| r.was_purged);
            self.ranges.drain(first..last);
            self.ranges.insert(
                first,
                VolatilePageRange {
                    base: merged_base,
                    count: merged_end - merged_base,
                    was_purged,
                },
            );
            covered < range.count
        } else {
            self.ranges.insert(first, range);
            true
        }
    }

    /// Remove `range` from the set
    ///
    /// Returns whether anything was removed and whether any removed range
    /// had been purged.
    pub fn remove(&mut self, range: VolatilePageRange) -> (bool, bool) {
        let range = range.intersected(&self.total_range);
        if range.is_empty() {
            return (false, false);
        }

        let mut removed = false;
        let mut was_purged = false;
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if !existing.intersects(&range) {
                result.push(existing);
                continue;
            }
            removed = true;
            was_purged |= existing.was_purged;
            if existing.base < range.base {
                result.push(VolatilePageRange {
                    base: existing.base,
                    count: range.base - existing.base,
                    was_purged: existing.was_purged,
                });
            }
            if existing.range_end() > range.range_end() {
                result.push(VolatilePageRange {
                    base: range.range_end(),
                    count: existing.range_end() - range.range_end(),
                    was_purged: existing.was_purged,
                });
            }
        }
        self.ranges = result;
        (removed, was_purged)
    }

    pub fn contains(&self, index: usize) -> bool {
        let i = self.ranges.partition_point(|r| r.range_end() <= index);
        self.ranges.get(i).map_or(false, |r| r.contains(index))
    }

    pub fn intersects(&self, range: &VolatilePageRange) -> bool {
        self.ranges.iter().any(|r| r.intersects(range))
    }

    /// Whether every page of `range` is covered
    pub fn contains_range(&self, range: &VolatilePageRange) -> bool {
        let covered: usize = self.ranges.iter().map(|r| r.intersected(range).count).sum();
        covered == range.count
    }

    /// Mark every range overlapping `range` as purged
    pub fn set_was_purged(&mut self, range: &VolatilePageRange) {
        for existing in self.ranges.iter_mut().filter(|r| r.intersects(range)) {
            existing.was_purged = true;
        }
    }

    /// Pages covered by both sets
    pub fn intersection(&self, other: &VolatilePageRanges) -> VolatilePageRanges {
        let mut result = VolatilePageRanges::new(self.total_range);
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = &self.ranges[i];
            let b = &other.ranges[j];
            let overlap = a.intersected(b);
            if !overlap.is_empty() {
                result.add_unchecked(VolatilePageRange {
                    was_purged: a.was_purged || b.was_purged,
                    ..overlap
                });
            }
            if a.range_end() <= b.range_end() {
                i += 1;
            } else {
                j += 1;
            }
        }
        result
    }

    /// Pages of the total range not covered by this set
    pub fn complement(&self) -> VolatilePageRanges {
        let mut result = VolatilePageRanges::new(self.total_range);
        let mut cursor = self.total_range.base;
        for range in &self.ranges {
            if range.base > cursor {
                result.add_unchecked(VolatilePageRange::new(cursor, range.base - cursor));
            }
            cursor = range.range_end();
        }
        if cursor < self.total_range.range_end() {
            result.add_unchecked(VolatilePageRange::new(cursor, self.total_range.range_end() - cursor));
        }
        result
    }
}

// ============================================================================
// Purgeable Page Ranges
// ============================================================================

/// A client's view of which pages of an anonymous object are volatile
pub struct PurgeablePageRanges {
    volatile_ranges: Mutex<VolatilePageRanges>,
    vmobject: Mutex<Weak<VmObject>>,
}

impl PurgeablePageRanges {
    /// Create a tracker for an object of `page_count` pages
    pub fn new(page_count: usize) -> Arc<Self> {
        Arc::new(Self {
            volatile_ranges: Mutex::new(VolatilePageRanges::new(VolatilePageRange::new(0, page_count))),
            vmobject: Mutex::new(Weak::new()),
        })
    }

    /// Declare `range` volatile
    ///
    /// Returns true if any page became newly volatile for this tracker.
    pub fn add_volatile_range(&self, range: VolatilePageRange) -> bool {
        if range.is_empty() {
            return false;
        }
        match self.vmobject() {
            Some(vmobject) => {
                let mut state = vmobject.lock();
                let added = self.volatile_ranges.lock().add(range);
                if added {
                    vmobject.range_made_volatile(&mut state, range);
                }
                added
            }
            None => self.volatile_ranges.lock().add(range),
        }
    }

    /// Declare `range` non-volatile again
    ///
    /// Returns whether anything was removed and whether any of it had been
    /// purged in the meantime.
    pub fn remove_volatile_range(&self, range: VolatilePageRange) -> (bool, bool) {
        if range.is_empty() {
            return (false, false);
        }
        match self.vmobject() {
            Some(vmobject) => {
                let mut state = vmobject.lock();
                let (removed, was_purged) = self.volatile_ranges.lock().remove(range);
                if removed {
                    vmobject.range_made_nonvolatile(&mut state, range);
                }
                (removed, was_purged)
            }
            None => self.volatile_ranges.lock().remove(range),
        }
    }

    pub fn is_volatile(&self, index: usize) -> bool {
        self.volatile_ranges.lock().contains(index)
    }

    pub fn is_volatile_range(&self, range: &VolatilePageRange) -> bool {
        self.volatile_ranges.lock().contains_range(range)
    }

    pub fn is_empty(&self) -> bool {
        self.volatile_ranges.lock().is_empty()
    }

    /// Whether any range overlapping `range` was purged
    pub fn was_purged(&self, range: &VolatilePageRange) -> bool {
        self.volatile_ranges
            .lock()
            .ranges()
            .iter()
            .any(|r| r.was_purged && r.intersects(range))
    }

    pub fn set_was_purged(&self, range: &VolatilePageRange) {
        self.volatile_ranges.lock().set_was_purged(range);
    }

    /// Object this tracker is registered with
    pub fn vmobject(&self) -> Option<Arc<VmObject>> {
        self.vmobject.lock().upgrade()
    }

    pub(crate) fn set_vmobject(&self, vmobject: Weak<VmObject>) {
        *self.vmobject.lock() = vmobject;
    }

    pub(crate) fn volatile_ranges(&self) -> MutexGuard<'_, VolatilePageRanges> {
        self.volatile_ranges.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(total: usize) -> VolatilePageRanges {
        VolatilePageRanges::new(VolatilePageRange::new(0, total))
    }

    #[test]
    fn test_add_merges_adjacent_and_overlapping() {
        let mut set = ranges(32);
        assert!(set.add(VolatilePageRange::new(2, 3)));
        assert!(set.add(VolatilePageRange::new(5, 2)));
        assert_eq!(set.ranges(), &[VolatilePageRange::new(2, 5)]);
        assert!(!set.add(VolatilePageRange::new(3, 2)));
        assert!(set.add(VolatilePageRange::new(10, 1)));
        assert!(set.add(VolatilePageRange::new(0, 12)));
        assert_eq!(set.ranges(), &[VolatilePageRange::new(0, 12)]);
    }

    #[test]
    fn test_add_clips_to_total_range() {
        let mut set = ranges(8);
        assert!(set.add(VolatilePageRange::new(6, 10)));
        assert_eq!(set.ranges(), &[VolatilePageRange::new(6, 2)]);
        assert!(!set.add(VolatilePageRange::new(20, 2)));
    }

    #[test]
    fn test_remove_splits_and_reports_purge() {
        let mut set = ranges(16);
        set.add(VolatilePageRange::new(0, 10));
        set.set_was_purged(&VolatilePageRange::new(4, 1));
        let (removed, was_purged) = set.remove(VolatilePageRange::new(3, 2));
        assert!(removed);
        assert!(was_purged);
        assert_eq!(set.ranges().len(), 2);
        assert!(set.contains(2));
        assert!(!set.contains(3));
        assert!(set.contains(5));
        assert_eq!(set.remove(VolatilePageRange::new(12, 2)), (false, false));
    }

    #[test]
    fn test_intersection_and_complement() {
        let mut a = ranges(16);
        a.add(VolatilePageRange::new(0, 8));
        let mut b = ranges(16);
        b.add(VolatilePageRange::new(4, 8));
        let both = a.intersection(&b);
        assert_eq!(both.ranges(), &[VolatilePageRange::new(4, 4)]);

        let rest = both.complement();
        assert_eq!(
            rest.ranges(),
            &[VolatilePageRange::new(0, 4), VolatilePageRange::new(8, 8)]
        );
        assert_eq!(rest.page_count(), 12);
    }

    #[test]
    fn test_unregistered_tracker() {
        let tracker = PurgeablePageRanges::new(8);
        assert!(tracker.is_empty());
        assert!(tracker.add_volatile_range(VolatilePageRange::new(1, 2)));
        assert!(tracker.is_volatile(2));
        assert!(tracker.is_volatile_range(&VolatilePageRange::new(1, 2)));
        assert!(!tracker.was_purged(&VolatilePageRange::new(1, 2)));
        assert_eq!(tracker.remove_volatile_range(VolatilePageRange::new(0, 8)), (true, false));
        assert!(tracker.vmobject().is_none());
    }
}
