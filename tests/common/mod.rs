//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use vmcore::error::InodeError;
use vmcore::vm::{
    Access, AllocationStrategy, Cacheable, FrameAllocator, FramePool, Inode, MemoryManager, PageDirectory, PageFault,
    PageFaultAccess, PageFaultType, Region, ShouldFlushTlb, VmObject, PAGE_SIZE,
};
use vmcore::{VirtualAddress, VirtualRange};

/// Base of every test mapping
pub const BASE: u64 = 0x4000_0000;

pub struct Fixture {
    pub pool: Arc<FramePool>,
    pub mm: Arc<MemoryManager>,
}

impl Fixture {
    pub fn new(frames: usize) -> Self {
        let pool = Arc::new(FramePool::new(frames));
        let mm = MemoryManager::new(pool.clone());
        Self { pool, mm }
    }

    pub fn anonymous(&self, pages: usize, strategy: AllocationStrategy) -> Arc<VmObject> {
        VmObject::try_create_with_size(&self.mm, (pages * PAGE_SIZE) as u64, strategy).unwrap()
    }

    /// Map all of `vmobject` at [`BASE`] in a fresh page directory
    pub fn map(&self, vmobject: Arc<VmObject>, access: Access, shared: bool) -> (Arc<Region>, Arc<PageDirectory>) {
        let pd = Arc::new(PageDirectory::unbounded());
        let range = allocate_range(&pd, vmobject.size());
        let region = Region::try_create_user_accessible(
            &self.mm,
            range,
            vmobject,
            0,
            Some("test"),
            access,
            Cacheable::Yes,
            shared,
        )
        .unwrap();
        region.map(&pd, ShouldFlushTlb::Yes).unwrap();
        (region, pd)
    }

    /// Map a region produced by `Region::try_clone` into a fresh page directory
    pub fn map_clone(&self, region: &Arc<Region>) -> Arc<PageDirectory> {
        let pd = Arc::new(PageDirectory::unbounded());
        pd.lock().range_allocator().allocate_specific(region.range()).unwrap();
        region.map(&pd, ShouldFlushTlb::Yes).unwrap();
        pd
    }

    pub fn write_byte(&self, region: &Region, page: usize, offset: usize, value: u8) {
        let frame = region.physical_page(page).unwrap();
        let mut bytes = self.pool.quickmap_page(&frame).unwrap();
        bytes[offset] = value;
    }

    pub fn read_byte(&self, region: &Region, page: usize, offset: usize) -> u8 {
        let frame = region.physical_page(page).unwrap();
        let bytes = self.pool.quickmap_page(&frame).unwrap();
        bytes[offset]
    }
}

pub fn allocate_range(pd: &PageDirectory, size: u64) -> VirtualRange {
    pd.lock()
        .range_allocator()
        .allocate_specific(VirtualRange::new(VirtualAddress::new(BASE), size))
        .unwrap()
}

pub fn page_vaddr(page: usize) -> VirtualAddress {
    VirtualAddress::new(BASE + (page * PAGE_SIZE) as u64)
}

pub fn write_fault(page: usize) -> PageFault {
    PageFault::new(page_vaddr(page), PageFaultType::ProtectionViolation, PageFaultAccess::Write)
}

pub fn read_fault(page: usize) -> PageFault {
    PageFault::new(page_vaddr(page), PageFaultType::PageNotPresent, PageFaultAccess::Read)
}

/// In-memory file whose byte at offset `i` is `i % 251`
pub struct TestInode {
    len: usize,
}

impl TestInode {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self { len })
    }

    pub fn byte_at(offset: usize) -> u8 {
        (offset % 251) as u8
    }
}

impl Inode for TestInode {
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, InodeError> {
        let offset = offset as usize;
        if offset > self.len {
            return Err(InodeError::OutOfBounds { offset: offset as u64 });
        }
        let n = buffer.len().min(self.len - offset);
        for (i, byte) in buffer[..n].iter_mut().enumerate() {
            *byte = Self::byte_at(offset + i);
        }
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.len as u64
    }
}
