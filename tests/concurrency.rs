//! Racing faults on the same page resolve to a single frame

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use vmcore::vm::{Access, AllocationStrategy, PageFaultResponse, Region, VmObject};

const THREADS: usize = 4;

fn race<F>(region: &Arc<Region>, fault: F) -> Vec<PageFaultResponse>
where
    F: Fn() -> vmcore::vm::PageFault + Send + Sync + Copy + 'static,
{
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let region = region.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                region.handle_fault(&fault())
            })
        })
        .collect();
    handles.into_iter().map(|handle| handle.join().unwrap()).collect()
}

#[test]
fn test_racing_zero_faults_share_one_frame() {
    let f = Fixture::new(8);
    let object = f.anonymous(1, AllocationStrategy::None);
    let (region, pd) = f.map(object.clone(), Access::READ | Access::WRITE, false);

    let responses = race(&region, || write_fault(0));
    assert!(responses.iter().all(|r| *r == PageFaultResponse::Continue));
    assert_eq!(f.pool.stats().allocated, 1);

    let page = object.physical_page(0).unwrap();
    assert!(!page.is_sentinel());
    assert_eq!(pd.translate(page_vaddr(0)).unwrap(), page.paddr());
}

#[test]
fn test_racing_cow_faults_copy_once() {
    let f = Fixture::new(8);
    let object = f.anonymous(1, AllocationStrategy::AllocateNow);
    let (parent, _parent_pd) = f.map(object, Access::READ | Access::WRITE, false);
    f.write_byte(&parent, 0, 3, 0x77);
    let child = parent.try_clone().unwrap();
    let _child_pd = f.map_clone(&child);

    let responses = race(&child, || write_fault(0));
    assert!(responses.iter().all(|r| *r == PageFaultResponse::Continue));
    assert_eq!(f.pool.stats().allocated, 2);
    assert_eq!(f.pool.stats().committed, 0);
    assert_eq!(f.read_byte(&child, 0, 3), 0x77);
    assert_eq!(child.vmobject().cow_pages(), 0);
}

#[test]
fn test_racing_inode_faults_read_once() {
    let f = Fixture::new(8);
    let object = VmObject::create_private_inode(&f.mm, TestInode::new(2 * vmcore::vm::PAGE_SIZE));
    let (region, _pd) = f.map(object.clone(), Access::READ, false);

    let responses = race(&region, || read_fault(1));
    assert!(responses.iter().all(|r| *r == PageFaultResponse::Continue));
    assert_eq!(object.amount_cached(), 1);
    assert_eq!(f.pool.stats().allocated, 1);
    assert_eq!(
        f.read_byte(&region, 1, 5),
        TestInode::byte_at(vmcore::vm::PAGE_SIZE + 5)
    );
}

#[test]
fn test_repeated_lazy_fault_reinstalls_frame() {
    let f = Fixture::new(4);
    let object = f.anonymous(1, AllocationStrategy::Reserve);
    let (region, pd) = f.map(object.clone(), Access::READ | Access::WRITE, false);

    assert_eq!(region.handle_fault(&read_fault(0)), PageFaultResponse::Continue);
    let page = object.physical_page(0).unwrap();

    // A second CPU that faulted before the first one filled the slot
    assert_eq!(region.handle_fault(&read_fault(0)), PageFaultResponse::Continue);
    assert_eq!(object.physical_page(0).unwrap().paddr(), page.paddr());
    assert_eq!(pd.translate(page_vaddr(0)).unwrap(), page.paddr());
    assert_eq!(object.unused_committed_pages(), 0);
    assert_eq!(f.pool.stats().allocated, 1);
}

#[test]
fn test_racing_lazy_faults_commit_once() {
    let f = Fixture::new(4);
    let object = f.anonymous(1, AllocationStrategy::Reserve);
    let (region, _pd) = f.map(object.clone(), Access::READ | Access::WRITE, false);

    let responses = race(&region, || read_fault(0));
    assert!(responses.iter().all(|r| *r == PageFaultResponse::Continue));
    assert_eq!(object.unused_committed_pages(), 0);
    assert_eq!(f.pool.stats().allocated, 1);
    assert_eq!(f.pool.stats().committed, 0);
}
