//! Virtual Memory Core
//!
//! Provides the machine-independent half of paging:
//! - vm_page: Physical frame handles and page arithmetic
//! - vm_resident: Frame allocator seam and the hosted frame pool
//! - pmap: Page directory, page table entries and range allocation
//! - vm_object: Page-slot containers shared by regions
//! - anonymous: Anonymous objects with lazy commit and copy-on-write
//! - inode: File-backed objects and the backing-store seam
//! - cow: COW bitmap and the committed COW pool
//! - purgeable: Volatile page ranges and purge trackers
//! - region: Mapped windows onto objects
//! - vm_fault: Page fault resolution
//! - memory_manager: Region registry and fault entry point

pub mod anonymous;
pub mod cow;
pub mod inode;
pub mod memory_manager;
pub mod pmap;
pub mod purgeable;
pub mod region;
pub mod vm_fault;
pub mod vm_object;
pub mod vm_page;
pub mod vm_resident;

pub use anonymous::AllocationStrategy;
pub use cow::{CommittedCowPages, CowMap};
pub use inode::Inode;
pub use memory_manager::MemoryManager;
pub use pmap::{PageDirectory, PageTableEntry, PteFlags, RangeAllocator};
pub use purgeable::{PurgeablePageRanges, VolatilePageRange, VolatilePageRanges};
pub use region::{Access, Cacheable, Region, ShouldDeallocateVirtualMemoryRange, ShouldFlushTlb};
pub use vm_fault::{PageFault, PageFaultAccess, PageFaultResponse, PageFaultType};
pub use vm_object::{VmObject, VmObjectKind, VmObjectState};
pub use vm_page::{PageKind, PhysicalPage, PAGE_SIZE};
pub use vm_resident::{FrameAllocator, FramePool, FramePoolStats, ShouldZeroFill};
