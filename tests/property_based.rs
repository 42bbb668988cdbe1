//! Property-based tests for the VM bookkeeping structures
//!
//! These tests drive the range sets, the COW bitmap and the virtual range
//! allocator with random operation sequences and compare them against a
//! plain per-page model.

use proptest::prelude::*;
use vmcore::vm::{CowMap, RangeAllocator, VolatilePageRange, VolatilePageRanges, PAGE_SIZE};
use vmcore::{VirtualAddress, VirtualRange};

const TOTAL_PAGES: usize = 64;

fn page_set() -> VolatilePageRanges {
    VolatilePageRanges::new(VolatilePageRange::new(0, TOTAL_PAGES))
}

fn range_ops() -> impl Strategy<Value = Vec<(bool, usize, usize)>> {
    prop::collection::vec((any::<bool>(), 0usize..80, 0usize..24), 1..40)
}

fn apply(set: &mut VolatilePageRanges, model: &mut [bool], ops: &[(bool, usize, usize)]) {
    for &(is_add, base, count) in ops {
        let range = VolatilePageRange::new(base, count);
        let pages = base.min(TOTAL_PAGES)..(base + count).min(TOTAL_PAGES);
        if is_add {
            let expected = pages.clone().any(|i| !model[i]);
            assert_eq!(set.add(range), expected, "add {:?}", range);
            pages.for_each(|i| model[i] = true);
        } else {
            let expected = pages.clone().any(|i| model[i]);
            let (removed, _) = set.remove(range);
            assert_eq!(removed, expected, "remove {:?}", range);
            pages.for_each(|i| model[i] = false);
        }
    }
}

fn assert_well_formed(set: &VolatilePageRanges) {
    for range in set.ranges() {
        assert!(!range.is_empty());
        assert!(range.range_end() <= TOTAL_PAGES);
    }
    for pair in set.ranges().windows(2) {
        // Disjoint and never adjacent
        assert!(pair[0].range_end() < pair[1].base);
    }
}

// ════════════════════════════════════════════════════════════
// Volatile Range Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Range set membership matches a per-page model
    #[test]
    fn volatile_ranges_match_model(ops in range_ops()) {
        let mut set = page_set();
        let mut model = [false; TOTAL_PAGES];
        apply(&mut set, &mut model, &ops);

        assert_well_formed(&set);
        for (i, &expected) in model.iter().enumerate() {
            prop_assert_eq!(set.contains(i), expected);
        }
        prop_assert_eq!(set.page_count(), model.iter().filter(|&&v| v).count());
        prop_assert!(!set.contains(TOTAL_PAGES));
    }

    /// Complement covers exactly the pages the set does not
    #[test]
    fn complement_partitions_total_range(ops in range_ops()) {
        let mut set = page_set();
        let mut model = [false; TOTAL_PAGES];
        apply(&mut set, &mut model, &ops);

        let complement = set.complement();
        assert_well_formed(&complement);
        for i in 0..TOTAL_PAGES {
            prop_assert_ne!(set.contains(i), complement.contains(i));
        }
        prop_assert_eq!(set.page_count() + complement.page_count(), TOTAL_PAGES);
    }

    /// Intersection covers the pages both sets cover
    #[test]
    fn intersection_matches_model(left in range_ops(), right in range_ops()) {
        let mut a = page_set();
        let mut a_model = [false; TOTAL_PAGES];
        apply(&mut a, &mut a_model, &left);
        let mut b = page_set();
        let mut b_model = [false; TOTAL_PAGES];
        apply(&mut b, &mut b_model, &right);

        let both = a.intersection(&b);
        for i in 0..TOTAL_PAGES {
            prop_assert_eq!(both.contains(i), a_model[i] && b_model[i]);
        }
    }
}

// ════════════════════════════════════════════════════════════
// COW Bitmap Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Bit operations match a vector of bools
    #[test]
    fn cow_map_matches_model(
        len in 1usize..200,
        initial in any::<bool>(),
        ops in prop::collection::vec((any::<prop::sample::Index>(), any::<bool>()), 0..64),
    ) {
        let mut map = CowMap::new(len, initial);
        let mut model = vec![initial; len];
        for (index, value) in ops {
            let i = index.index(len);
            map.set(i, value);
            model[i] = value;
        }
        for (i, &expected) in model.iter().enumerate() {
            prop_assert_eq!(map.get(i), expected);
        }
        prop_assert_eq!(map.count_set(), model.iter().filter(|&&v| v).count());

        map.fill(true);
        prop_assert_eq!(map.count_set(), len);
    }
}

// ════════════════════════════════════════════════════════════
// Range Allocator Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Allocations never overlap and freeing them all restores the range
    #[test]
    fn range_allocator_round_trip(
        sizes in prop::collection::vec(1usize..8, 1..16),
        order in any::<prop::sample::Index>(),
    ) {
        let total = VirtualRange::new(VirtualAddress::new(0x1000_0000), (TOTAL_PAGES * PAGE_SIZE) as u64);
        let mut allocator = RangeAllocator::new(total);

        let mut allocated: Vec<VirtualRange> = Vec::new();
        for pages in sizes {
            if let Some(range) = allocator.allocate_anywhere((pages * PAGE_SIZE) as u64) {
                prop_assert!(total.contains_range(&range));
                prop_assert!(allocated.iter().all(|other| !other.overlaps(&range)));
                allocated.push(range);
            }
        }
        let used: u64 = allocated.iter().map(VirtualRange::size).sum();
        prop_assert_eq!(allocator.available_size(), total.size() - used);

        if !allocated.is_empty() {
            let start = order.index(allocated.len());
            allocated.rotate_left(start);
        }
        for range in allocated {
            allocator.deallocate(range);
        }
        prop_assert_eq!(allocator.available_size(), total.size());
        prop_assert_eq!(allocator.allocate_anywhere(total.size()), Some(total));
    }
}
