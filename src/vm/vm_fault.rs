//! VM Fault - Page Fault Handling
//!
//! Faults arrive at a region as a [`PageFault`] and are resolved into a
//! [`PageFaultResponse`]. The region classifies the fault and picks one of
//! three paths:
//!
//! - **zero fault**: a sentinel page is written (or a lazy page touched);
//!   a real frame replaces it
//! - **cow fault**: a shared frame is written through a private mapping;
//!   the object gives the slot a private copy
//! - **inode fault**: a file-backed page is not yet resident; it is read
//!   from the inode with the object lock released
//!
//! Every path re-checks the slot under the object lock, so racing faults
//! on the same page resolve to a single frame.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::PAGE_FAULT_DEBUG;
use crate::types::VirtualAddress;
use crate::vm::region::Region;
use crate::vm::vm_object::{VmObject, VmObjectState};
use crate::vm::vm_page::PAGE_SIZE;
use crate::vm::vm_resident::ShouldZeroFill;

// ============================================================================
// Fault description and result
// ============================================================================

/// Why the hardware raised the fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultType {
    /// No translation was installed
    PageNotPresent,
    /// A translation exists but forbids the access
    ProtectionViolation,
}

/// Direction of the faulting access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultAccess {
    Read,
    Write,
}

/// A page fault as reported by the trap handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    vaddr: VirtualAddress,
    fault_type: PageFaultType,
    access: PageFaultAccess,
}

impl PageFault {
    pub const fn new(vaddr: VirtualAddress, fault_type: PageFaultType, access: PageFaultAccess) -> Self {
        Self {
            vaddr,
            fault_type,
            access,
        }
    }

    pub const fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    pub const fn fault_type(&self) -> PageFaultType {
        self.fault_type
    }

    pub const fn access(&self) -> PageFaultAccess {
        self.access
    }

    pub fn is_read(&self) -> bool {
        self.access == PageFaultAccess::Read
    }

    pub fn is_write(&self) -> bool {
        self.access == PageFaultAccess::Write
    }
}

/// Result of a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// Terminate the faulting context
    ShouldCrash,
    /// No frame was available
    OutOfMemory,
    /// Resolved; retry the access
    Continue,
}

// ============================================================================
// Fault Statistics
// ============================================================================

static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Zero-fill faults
    pub zero_fill: AtomicU64,
    /// Copy-on-write faults
    pub cow: AtomicU64,
    /// Inode page-in faults
    pub inode: AtomicU64,
    /// Lazy-commit pages made real
    pub lazy_commit: AtomicU64,
    /// Faults answered with ShouldCrash or OutOfMemory
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            inode: AtomicU64::new(0),
            lazy_commit: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inode(&self) {
        self.inode.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_lazy_commit(&self) {
        self.lazy_commit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Page Fault Handling
// ============================================================================

impl Region {
    /// Resolve a fault at an address inside this region
    pub fn handle_fault(&self, fault: &PageFault) -> PageFaultResponse {
        assert!(self.contains(fault.vaddr()), "Region: fault outside {}", self);
        FAULT_STATS.incr_total();

        let response = self.classify_fault(fault);
        if response != PageFaultResponse::Continue {
            FAULT_STATS.incr_failures();
        }
        response
    }

    fn classify_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let page_index = self.page_index_from_address(fault.vaddr());

        if fault.fault_type() == PageFaultType::PageNotPresent {
            if fault.is_read() && !self.is_readable() {
                log::warn!("NP(non-readable) fault in {}[{}]", self, page_index);
                return PageFaultResponse::ShouldCrash;
            }
            if fault.is_write() && !self.is_writable() {
                log::warn!(
                    "NP(non-writable) write fault in {}[{}] at {}",
                    self,
                    page_index,
                    fault.vaddr()
                );
                return PageFaultResponse::ShouldCrash;
            }

            let vmobject = self.vmobject();
            if vmobject.is_inode() {
                if PAGE_FAULT_DEBUG {
                    log::trace!("NP(inode) fault in {}[{}]", self, page_index);
                }
                return self.handle_inode_fault(page_index);
            }

            let vmobject_page_index = self.translate_to_vmobject_page(page_index);
            let mut state = vmobject.lock();
            let is_lazy = match state.physical_page(vmobject_page_index) {
                Some(page) => page.is_lazy_committed_page(),
                None => panic!("Region: unexpected NP fault at {} in {}", fault.vaddr(), self),
            };
            if !is_lazy {
                // Lost the race: the slot was filled while this fault was in flight
                if PAGE_FAULT_DEBUG {
                    log::trace!("NP(present) fault in {}[{}] at {}", self, page_index, fault.vaddr());
                }
                if !vmobject.remap_page(&state, vmobject_page_index) {
                    return PageFaultResponse::OutOfMemory;
                }
                return PageFaultResponse::Continue;
            }
            let page = vmobject.allocate_committed_page(&mut state, vmobject_page_index);
            state.physical_pages[vmobject_page_index] = Some(page);
            FAULT_STATS.incr_lazy_commit();
            if !vmobject.remap_page(&state, vmobject_page_index) {
                return PageFaultResponse::OutOfMemory;
            }
            return PageFaultResponse::Continue;
        }

        if fault.is_write() && self.is_writable() && self.should_cow(page_index) {
            if PAGE_FAULT_DEBUG {
                log::trace!("PV(cow) fault in {}[{}] at {}", self, page_index, fault.vaddr());
            }
            let is_sentinel = self
                .physical_page(page_index)
                .map_or(false, |page| page.is_sentinel());
            if is_sentinel {
                if PAGE_FAULT_DEBUG {
                    log::trace!("NP(zero) fault in {}[{}] at {}", self, page_index, fault.vaddr());
                }
                return self.handle_zero_fault(page_index);
            }
            return self.handle_cow_fault(page_index, fault.vaddr());
        }

        if fault.is_write() && self.is_writable() {
            // Stale fault: a racing fault already gave the page a writable frame
            let vmobject = self.vmobject();
            let vmobject_page_index = self.translate_to_vmobject_page(page_index);
            let state = vmobject.lock();
            if state.physical_page(vmobject_page_index).is_some() {
                if PAGE_FAULT_DEBUG {
                    log::trace!("PV(stale) fault in {}[{}] at {}", self, page_index, fault.vaddr());
                }
                if !vmobject.remap_page(&state, vmobject_page_index) {
                    return PageFaultResponse::OutOfMemory;
                }
                return PageFaultResponse::Continue;
            }
        }

        log::warn!("PV(error) fault in {}[{}] at {}", self, page_index, fault.vaddr());
        PageFaultResponse::ShouldCrash
    }

    fn handle_zero_fault(&self, page_index: usize) -> PageFaultResponse {
        let vmobject = self.vmobject();
        assert!(vmobject.is_anonymous(), "Region: zero fault on an inode object");
        let vmobject_page_index = self.translate_to_vmobject_page(page_index);
        let mut state = vmobject.lock();
        self.zero_fault_locked(&vmobject, &mut state, vmobject_page_index)
    }

    fn zero_fault_locked(
        &self,
        vmobject: &VmObject,
        state: &mut VmObjectState,
        vmobject_page_index: usize,
    ) -> PageFaultResponse {
        let current = state.physical_page(vmobject_page_index);
        if current.map_or(false, |page| !page.is_sentinel()) {
            if PAGE_FAULT_DEBUG {
                log::trace!("MM: zero_page() but page already present. Fine with me!");
            }
            if !vmobject.remap_page(state, vmobject_page_index) {
                return PageFaultResponse::OutOfMemory;
            }
            return PageFaultResponse::Continue;
        }
        let is_lazy = current.map_or(false, |page| page.is_lazy_committed_page());

        FAULT_STATS.incr_zero_fill();

        let page = if is_lazy {
            FAULT_STATS.incr_lazy_commit();
            vmobject.allocate_committed_page(state, vmobject_page_index)
        } else {
            match vmobject.allocator().allocate_user_physical_page(ShouldZeroFill::Yes) {
                Some(page) => page,
                None => {
                    log::warn!("MM: handle_zero_fault was unable to allocate a physical page");
                    return PageFaultResponse::OutOfMemory;
                }
            }
        };
        if PAGE_FAULT_DEBUG {
            log::trace!("      >> ALLOCATED {}", page.paddr());
        }
        state.physical_pages[vmobject_page_index] = Some(page);

        if !vmobject.remap_page(state, vmobject_page_index) {
            log::warn!("MM: handle_zero_fault was unable to allocate a page table to map {}", self);
            return PageFaultResponse::OutOfMemory;
        }
        PageFaultResponse::Continue
    }

    fn handle_cow_fault(&self, page_index: usize, vaddr: VirtualAddress) -> PageFaultResponse {
        FAULT_STATS.incr_cow();
        let vmobject = self.vmobject();
        if !vmobject.is_anonymous() {
            return PageFaultResponse::ShouldCrash;
        }

        let vmobject_page_index = self.translate_to_vmobject_page(page_index);
        let mut state = vmobject.lock();

        // A racing fault may have resolved the page since classification
        if state
            .physical_page(vmobject_page_index)
            .map_or(false, |page| page.is_sentinel())
        {
            return self.zero_fault_locked(&vmobject, &mut state, vmobject_page_index);
        }
        let response = if vmobject.should_cow_locked(&state, vmobject_page_index, self.is_shared()) {
            vmobject.handle_cow_fault(&mut state, vmobject_page_index, vaddr)
        } else {
            PageFaultResponse::Continue
        };

        if !vmobject.remap_page(&state, vmobject_page_index) {
            return PageFaultResponse::OutOfMemory;
        }
        response
    }

    fn handle_inode_fault(&self, page_index: usize) -> PageFaultResponse {
        let vmobject = self.vmobject();
        let Some(inode) = vmobject.inode().cloned() else {
            panic!("Region: inode fault on an anonymous object");
        };
        let vmobject_page_index = self.translate_to_vmobject_page(page_index);

        {
            let state = vmobject.lock();
            if state.physical_page(vmobject_page_index).is_some() {
                if PAGE_FAULT_DEBUG {
                    log::trace!("MM: page_in_from_inode() but page already present. Fine with me!");
                }
                if !vmobject.remap_page(&state, vmobject_page_index) {
                    return PageFaultResponse::OutOfMemory;
                }
                return PageFaultResponse::Continue;
            }
        }

        FAULT_STATS.incr_inode();

        // Read with the object lock released
        let mut page_buffer = [0u8; PAGE_SIZE];
        let offset = (vmobject_page_index * PAGE_SIZE) as u64;
        let nread = match inode.read_bytes(offset, &mut page_buffer) {
            Ok(nread) => nread,
            Err(err) => {
                log::warn!("MM: handle_inode_fault had error ({}) while reading!", err);
                return PageFaultResponse::ShouldCrash;
            }
        };
        if nread < PAGE_SIZE {
            page_buffer[nread..].fill(0);
        }

        let mut state = vmobject.lock();
        if state.physical_page(vmobject_page_index).is_some() {
            // Someone else paged it in while we were reading
            if !vmobject.remap_page(&state, vmobject_page_index) {
                return PageFaultResponse::OutOfMemory;
            }
            return PageFaultResponse::Continue;
        }

        let allocator = vmobject.allocator();
        let Some(page) = allocator.allocate_user_physical_page(ShouldZeroFill::No) else {
            log::warn!("MM: handle_inode_fault was unable to allocate a physical page");
            return PageFaultResponse::OutOfMemory;
        };
        match allocator.quickmap_page(&page) {
            Ok(mut dest) => dest.copy_from_slice(&page_buffer),
            Err(err) => {
                log::error!("MM: handle_inode_fault could not map {}: {}", page.paddr(), err);
                panic!("Region: fault while filling an inode page");
            }
        }
        state.physical_pages[vmobject_page_index] = Some(page);

        if !vmobject.remap_page(&state, vmobject_page_index) {
            return PageFaultResponse::OutOfMemory;
        }
        PageFaultResponse::Continue
    }
}
