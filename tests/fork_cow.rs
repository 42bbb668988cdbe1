//! Fork and copy-on-write behaviour across cloned regions

mod common;

use std::sync::Arc;

use common::*;
use vmcore::vm::{Access, AllocationStrategy, PageFaultResponse, PurgeablePageRanges, VolatilePageRange};
use vmcore::VmError;

#[test]
fn test_fork_then_write_both_sides() {
    let f = Fixture::new(4);
    let object = f.anonymous(1, AllocationStrategy::AllocateNow);
    let (parent, parent_pd) = f.map(object.clone(), Access::READ | Access::WRITE, false);
    f.write_byte(&parent, 0, 0, 0xAB);
    assert!(parent_pd.entry(page_vaddr(0)).unwrap().is_writable());

    let child = parent.try_clone().unwrap();
    let child_pd = f.map_clone(&child);
    let child_object = child.vmobject();

    // Both sides share one frame and lost write access to it
    assert_eq!(object.page_ref_count(0), 2);
    assert!(parent.physical_page(0).unwrap().ptr_eq(&child.physical_page(0).unwrap()));
    assert!(!parent_pd.entry(page_vaddr(0)).unwrap().is_writable());
    assert!(!child_pd.entry(page_vaddr(0)).unwrap().is_writable());
    assert_eq!(object.committed_cow_pages(), Some(1));
    assert_eq!(f.pool.stats().committed, 1);

    // The child copies out of the committed pool
    assert_eq!(child.handle_fault(&write_fault(0)), PageFaultResponse::Continue);
    assert_eq!(f.read_byte(&child, 0, 0), 0xAB);
    assert_eq!(object.page_ref_count(0), 1);
    assert_eq!(child_object.page_ref_count(0), 1);
    assert!(child_pd.entry(page_vaddr(0)).unwrap().is_writable());
    assert_eq!(child_object.committed_cow_pages(), None);
    assert_eq!(f.pool.stats().committed, 0);
    assert_eq!(f.pool.stats().allocated, 2);

    // The parent is the sole owner now and only needs its bit cleared
    assert_eq!(parent.handle_fault(&write_fault(0)), PageFaultResponse::Continue);
    assert!(parent_pd.entry(page_vaddr(0)).unwrap().is_writable());
    assert_eq!(object.committed_cow_pages(), None);
    assert_eq!(object.cow_pages(), 0);
    assert_eq!(f.pool.stats().allocated, 2);

    f.write_byte(&child, 0, 0, 0xCD);
    assert_eq!(f.read_byte(&parent, 0, 0), 0xAB);
}

#[test]
fn test_parent_write_first_returns_nothing_to_pool() {
    let f = Fixture::new(4);
    let object = f.anonymous(1, AllocationStrategy::AllocateNow);
    let (parent, _parent_pd) = f.map(object.clone(), Access::READ | Access::WRITE, false);
    let child = parent.try_clone().unwrap();
    let _child_pd = f.map_clone(&child);

    assert_eq!(parent.handle_fault(&write_fault(0)), PageFaultResponse::Continue);
    assert_eq!(f.pool.stats().allocated, 2);
    assert_eq!(child.vmobject().committed_cow_pages(), Some(0));

    // The child is left holding the original frame alone
    assert_eq!(child.handle_fault(&write_fault(0)), PageFaultResponse::Continue);
    assert_eq!(f.pool.stats().allocated, 2);
    assert_eq!(f.pool.stats().committed, 0);
    assert_eq!(child.vmobject().committed_cow_pages(), None);
}

#[test]
fn test_fork_skips_volatile_pages() {
    let f = Fixture::new(8);
    let object = f.anonymous(4, AllocationStrategy::Reserve);
    let (parent, _parent_pd) = f.map(object.clone(), Access::READ | Access::WRITE, false);
    let tracker = PurgeablePageRanges::new(4);
    object.register_purgeable_page_ranges(&tracker);

    assert!(tracker.add_volatile_range(VolatilePageRange::new(1, 2)));
    assert_eq!(object.unused_committed_pages(), 2);
    assert_eq!(f.pool.stats().committed, 2);
    assert!(object.physical_page(1).unwrap().is_shared_zero_page());
    assert!(object.physical_page(0).unwrap().is_lazy_committed_page());

    let child = parent.try_clone().unwrap();
    let child_object = child.vmobject();
    assert_eq!(object.committed_cow_pages(), Some(2));
    assert_eq!(child_object.committed_cow_pages(), Some(2));
    assert_eq!(object.unused_committed_pages(), 2);
    assert_eq!(child_object.unused_committed_pages(), 0);
    assert_eq!(f.pool.stats().committed, 4);

    // The reservation stayed behind; the clone sees zero pages
    assert!(child_object.physical_page(0).unwrap().is_shared_zero_page());
    assert!(child_object.physical_page(3).unwrap().is_shared_zero_page());
    assert_eq!(child_object.cow_pages(), 4);

    // Page 1 was exempt from the reservation; each side zero-faults on its own
    let _child_pd = f.map_clone(&child);
    assert_eq!(parent.handle_fault(&write_fault(1)), PageFaultResponse::Continue);
    assert_eq!(child.handle_fault(&write_fault(1)), PageFaultResponse::Continue);
    let parent_page = parent.physical_page(1).unwrap();
    let child_page = child.physical_page(1).unwrap();
    assert!(!parent_page.is_sentinel() && !child_page.is_sentinel());
    assert!(!parent_page.ptr_eq(&child_page));
    assert_eq!(object.committed_cow_pages(), Some(2));
    assert_eq!(f.pool.stats().allocated, 2);

    object.unregister_purgeable_page_ranges(&tracker);
}

#[test]
fn test_failed_fork_leaves_parent_untouched() {
    let f = Fixture::new(2);
    let object = f.anonymous(2, AllocationStrategy::AllocateNow);
    let (parent, parent_pd) = f.map(object.clone(), Access::READ | Access::WRITE, false);

    assert_eq!(parent.try_clone().err(), Some(VmError::CommitFailed { pages: 2 }));
    assert_eq!(object.committed_cow_pages(), None);
    assert_eq!(object.cow_pages(), 0);
    assert_eq!(object.region_count(), 1);
    assert!(parent_pd.entry(page_vaddr(1)).unwrap().is_writable());
    assert_eq!(f.pool.stats().committed, 0);
}

#[test]
fn test_shared_region_clone_shares_object() {
    let f = Fixture::new(4);
    let object = f.anonymous(1, AllocationStrategy::AllocateNow);
    let (parent, parent_pd) = f.map(object.clone(), Access::READ | Access::WRITE, true);

    let child = parent.try_clone().unwrap();
    assert!(child.is_shared());
    assert!(Arc::ptr_eq(&child.vmobject(), &object));
    assert_eq!(object.region_count(), 2);
    assert_eq!(object.committed_cow_pages(), None);
    assert!(parent_pd.entry(page_vaddr(0)).unwrap().is_writable());

    let child_pd = f.map_clone(&child);
    assert!(child_pd.entry(page_vaddr(0)).unwrap().is_writable());
    f.write_byte(&child, 0, 7, 0x5A);
    assert_eq!(f.read_byte(&parent, 0, 7), 0x5A);
}

#[test]
fn test_dropping_both_sides_releases_everything() {
    let f = Fixture::new(4);
    let object = f.anonymous(2, AllocationStrategy::AllocateNow);
    let (parent, parent_pd) = f.map(object, Access::READ | Access::WRITE, false);
    let child = parent.try_clone().unwrap();
    let child_pd = f.map_clone(&child);
    assert_eq!(child.handle_fault(&write_fault(1)), PageFaultResponse::Continue);

    drop(child);
    drop(parent);
    assert_eq!(f.pool.stats().allocated, 0);
    assert_eq!(f.pool.stats().committed, 0);
    assert!(parent_pd.entry(page_vaddr(0)).map_or(true, |pte| !pte.is_present()));
    assert!(child_pd.entry(page_vaddr(0)).map_or(true, |pte| !pte.is_present()));
    assert_eq!(f.mm.user_region_count(), 0);
}
