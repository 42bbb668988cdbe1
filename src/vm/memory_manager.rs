//! Memory Manager - Region Registry and Fault Entry
//!
//! The memory manager ties the VM core to its collaborators: it owns the
//! frame allocator handle every object allocates through, keeps the
//! registry of live regions and routes page faults to the region covering
//! the faulting address.
//!
//! Its registry lock is the structural lock. It may be held while a page
//! directory lock is taken, never while a VM object lock is taken.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::config::{is_user_address, USER_RANGE_BASE};
use crate::types::{RegionId, VirtualAddress};
use crate::vm::pmap::PageDirectory;
use crate::vm::region::Region;
use crate::vm::vm_fault::{PageFault, PageFaultResponse};
use crate::vm::vm_resident::FrameAllocator;

/// Live regions, split by address space half
#[derive(Default)]
pub struct RegionRegistry {
    user: BTreeMap<RegionId, Weak<Region>>,
    kernel: BTreeMap<RegionId, Weak<Region>>,
}

/// Global VM bookkeeping
pub struct MemoryManager {
    allocator: Arc<dyn FrameAllocator>,
    regions: Mutex<RegionRegistry>,
}

impl MemoryManager {
    pub fn new(allocator: Arc<dyn FrameAllocator>) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            regions: Mutex::new(RegionRegistry::default()),
        })
    }

    pub fn allocator(&self) -> Arc<dyn FrameAllocator> {
        self.allocator.clone()
    }

    /// Take the structural lock
    pub(crate) fn lock_structural(&self) -> MutexGuard<'_, RegionRegistry> {
        self.regions.lock()
    }

    pub(crate) fn register_region(&self, id: RegionId, region: Weak<Region>, is_user: bool) {
        let mut regions = self.lock_structural();
        if is_user {
            regions.user.insert(id, region);
        } else {
            regions.kernel.insert(id, region);
        }
    }

    pub(crate) fn unregister_region(&self, id: RegionId) {
        let mut regions = self.lock_structural();
        if regions.user.remove(&id).is_none() {
            regions.kernel.remove(&id);
        }
    }

    pub fn user_region_count(&self) -> usize {
        self.lock_structural().user.len()
    }

    pub fn kernel_region_count(&self) -> usize {
        self.lock_structural().kernel.len()
    }

    /// User region mapped into `page_directory` that covers `vaddr`
    pub fn find_user_region_from_vaddr(
        &self,
        page_directory: &Arc<PageDirectory>,
        vaddr: VirtualAddress,
    ) -> Option<Arc<Region>> {
        // Upgraded handles are dropped outside the structural lock
        let candidates: Vec<Arc<Region>> = {
            let regions = self.lock_structural();
            regions.user.values().filter_map(Weak::upgrade).collect()
        };
        candidates.into_iter().find(|region| {
            region.contains(vaddr)
                && region
                    .page_directory()
                    .map_or(false, |pd| Arc::ptr_eq(&pd, page_directory))
        })
    }

    /// Kernel region covering `vaddr`
    pub fn find_kernel_region_from_vaddr(&self, vaddr: VirtualAddress) -> Option<Arc<Region>> {
        let candidates: Vec<Arc<Region>> = {
            let regions = self.lock_structural();
            regions.kernel.values().filter_map(Weak::upgrade).collect()
        };
        candidates.into_iter().find(|region| region.contains(vaddr))
    }

    pub fn find_region_from_vaddr(
        &self,
        page_directory: &Arc<PageDirectory>,
        vaddr: VirtualAddress,
    ) -> Option<Arc<Region>> {
        if vaddr.get() >= USER_RANGE_BASE && is_user_address(vaddr.get()) {
            self.find_user_region_from_vaddr(page_directory, vaddr)
        } else {
            self.find_kernel_region_from_vaddr(vaddr)
        }
    }

    /// Route a fault taken in `page_directory` to the region covering it
    pub fn handle_page_fault(&self, page_directory: &Arc<PageDirectory>, fault: &PageFault) -> PageFaultResponse {
        match self.find_region_from_vaddr(page_directory, fault.vaddr()) {
            Some(region) => region.handle_fault(fault),
            None => {
                log::warn!("MM: no region for page fault at {}", fault.vaddr());
                PageFaultResponse::ShouldCrash
            }
        }
    }
}
