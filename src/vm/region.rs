//! Region - Mapped Windows onto VM Objects
//!
//! A region maps a page-aligned virtual range onto a window of one VM
//! object, starting `offset_in_vmobject` bytes into it. It owns a strong
//! reference to its object and registers itself with the object so that
//! slot changes are pushed into its page directory.
//!
//! ## Key Operations
//!
//! - `map` / `unmap`: Install or remove every translation of the region
//! - `remap_vmobject_page`: Reinstall one slot after the object changed it
//! - `try_clone`: Fork the region, sharing or copy-on-write cloning its object
//! - `handle_fault`: Resolve a fault inside the region (see `vm_fault`)

use alloc::sync::{Arc, Weak};
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use heapless::String;
use spin::Mutex;

use crate::config::{is_user_address, KERNEL_BASE, REGION_NAME_MAX, USER_RANGE_BASE};
use crate::error::{VmError, VmResult};
use crate::types::{RegionId, VirtualAddress, VirtualRange};
use crate::vm::memory_manager::MemoryManager;
use crate::vm::pmap::{PageDirectory, PageTables};
use crate::vm::vm_object::{VmObject, VmObjectState};
use crate::vm::vm_page::{PhysicalPage, PAGE_SIZE};

// ============================================================================
// Region attributes
// ============================================================================

bitflags! {
    /// Access rights of a region
    ///
    /// The upper bits remember every right the region has ever held.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const HAS_BEEN_READABLE = 1 << 4;
        const HAS_BEEN_WRITABLE = 1 << 5;
        const HAS_BEEN_EXECUTABLE = 1 << 6;
    }
}

impl Access {
    /// Current rights without the history bits
    pub fn current(self) -> Access {
        self & (Access::READ | Access::WRITE | Access::EXECUTE)
    }

    fn with_history(self) -> Access {
        let current = self.current();
        current | Access::from_bits_truncate(current.bits() << 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheable {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldFlushTlb {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldDeallocateVirtualMemoryRange {
    Yes,
    No,
}

pub type RegionName = String<REGION_NAME_MAX>;

fn make_name(name: &str) -> RegionName {
    let mut result = RegionName::new();
    for c in name.chars() {
        if result.push(c).is_err() {
            break;
        }
    }
    result
}

// ============================================================================
// Region
// ============================================================================

/// A virtual range mapped onto a window of a VM object
pub struct Region {
    id: RegionId,
    mm: Arc<MemoryManager>,
    range: VirtualRange,
    offset_in_vmobject: usize,
    vmobject: Mutex<Arc<VmObject>>,
    name: Option<RegionName>,
    access: AtomicU8,
    shared: AtomicBool,
    cacheable: bool,
    stack: AtomicBool,
    mmap: AtomicBool,
    syscall_region: AtomicBool,
    page_directory: Mutex<Option<Arc<PageDirectory>>>,
    weak_self: Weak<Region>,
}

impl Region {
    /// Create a region user code may access
    #[allow(clippy::too_many_arguments)]
    pub fn try_create_user_accessible(
        mm: &Arc<MemoryManager>,
        range: VirtualRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: Option<&str>,
        access: Access,
        cacheable: Cacheable,
        shared: bool,
    ) -> VmResult<Arc<Region>> {
        Self::try_create(mm, range, vmobject, offset_in_vmobject, name, access, cacheable, shared)
    }

    /// Create a region for kernel use only; never shared
    pub fn try_create_kernel_only(
        mm: &Arc<MemoryManager>,
        range: VirtualRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: Option<&str>,
        access: Access,
        cacheable: Cacheable,
    ) -> VmResult<Arc<Region>> {
        Self::try_create(mm, range, vmobject, offset_in_vmobject, name, access, cacheable, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn try_create(
        mm: &Arc<MemoryManager>,
        range: VirtualRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: Option<&str>,
        access: Access,
        cacheable: Cacheable,
        shared: bool,
    ) -> VmResult<Arc<Region>> {
        if !range.base().is_page_aligned() || range.size() == 0 || range.size() % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidRange);
        }
        if offset_in_vmobject % PAGE_SIZE != 0 || offset_in_vmobject as u64 + range.size() > vmobject.size() {
            return Err(VmError::InvalidRange);
        }

        let id = RegionId::new();
        let region = Arc::new_cyclic(|weak: &Weak<Region>| {
            vmobject.add_region(id, weak.clone());
            Region {
                id,
                mm: mm.clone(),
                range,
                offset_in_vmobject,
                vmobject: Mutex::new(vmobject.clone()),
                name: name.map(make_name),
                access: AtomicU8::new(access.with_history().bits()),
                shared: AtomicBool::new(shared),
                cacheable: cacheable == Cacheable::Yes,
                stack: AtomicBool::new(false),
                mmap: AtomicBool::new(false),
                syscall_region: AtomicBool::new(false),
                page_directory: Mutex::new(None),
                weak_self: weak.clone(),
            }
        });
        mm.register_region(id, Arc::downgrade(&region), region.is_user());
        Ok(region)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn range(&self) -> VirtualRange {
        self.range
    }

    pub fn vaddr(&self) -> VirtualAddress {
        self.range.base()
    }

    pub fn size(&self) -> u64 {
        self.range.size()
    }

    pub fn page_count(&self) -> usize {
        self.range.page_count()
    }

    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    /// Index of the first object page this region maps
    pub fn first_page_index(&self) -> usize {
        self.offset_in_vmobject / PAGE_SIZE
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn vmobject(&self) -> Arc<VmObject> {
        self.vmobject.lock().clone()
    }

    pub fn page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.page_directory.lock().clone()
    }

    pub fn is_mapped(&self) -> bool {
        self.page_directory.lock().is_some()
    }

    pub fn access(&self) -> Access {
        Access::from_bits_truncate(self.access.load(Ordering::Relaxed)).current()
    }

    /// Every right this region has ever held
    pub fn max_access(&self) -> Access {
        let bits = Access::from_bits_truncate(self.access.load(Ordering::Relaxed));
        Access::from_bits_truncate(bits.bits() >> 4)
    }

    pub fn is_readable(&self) -> bool {
        self.access().contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access().contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access().contains(Access::EXECUTE)
    }

    fn set_access_bit(&self, bit: Access, value: bool) {
        if value {
            let history = Access::from_bits_truncate(bit.bits() << 4);
            self.access.fetch_or((bit | history).bits(), Ordering::Relaxed);
        } else {
            self.access.fetch_and(!bit.bits(), Ordering::Relaxed);
        }
    }

    pub fn set_readable(&self, readable: bool) {
        self.set_access_bit(Access::READ, readable);
    }

    pub fn set_writable(&self, writable: bool) {
        self.set_access_bit(Access::WRITE, writable);
    }

    pub fn set_executable(&self, executable: bool) {
        self.set_access_bit(Access::EXECUTE, executable);
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    pub fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Relaxed);
    }

    pub fn is_stack(&self) -> bool {
        self.stack.load(Ordering::Relaxed)
    }

    pub fn set_stack(&self, stack: bool) {
        self.stack.store(stack, Ordering::Relaxed);
    }

    pub fn is_mmap(&self) -> bool {
        self.mmap.load(Ordering::Relaxed)
    }

    pub fn set_mmap(&self, mmap: bool) {
        self.mmap.store(mmap, Ordering::Relaxed);
    }

    pub fn is_syscall_region(&self) -> bool {
        self.syscall_region.load(Ordering::Relaxed)
    }

    pub fn set_syscall_region(&self, syscall_region: bool) {
        self.syscall_region.store(syscall_region, Ordering::Relaxed);
    }

    pub fn is_kernel(&self) -> bool {
        self.vaddr().get() < USER_RANGE_BASE || self.vaddr().get() >= KERNEL_BASE
    }

    pub fn is_user(&self) -> bool {
        !self.is_kernel()
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        self.range.contains(vaddr)
    }

    // ========================================================================
    // Page index translation
    // ========================================================================

    pub fn vaddr_from_page_index(&self, page_index: usize) -> VirtualAddress {
        self.vaddr().offset((page_index * PAGE_SIZE) as u64)
    }

    pub fn page_index_from_address(&self, vaddr: VirtualAddress) -> usize {
        ((vaddr.get() - self.vaddr().get()) / PAGE_SIZE as u64) as usize
    }

    /// Object page index of region page `page_index`
    pub fn translate_to_vmobject_page(&self, page_index: usize) -> usize {
        self.first_page_index() + page_index
    }

    /// Region page index of object page `vmobject_page_index`, if mapped here
    pub fn translate_vmobject_page(&self, vmobject_page_index: usize) -> Option<usize> {
        let first = self.first_page_index();
        if vmobject_page_index < first || vmobject_page_index >= first + self.page_count() {
            return None;
        }
        Some(vmobject_page_index - first)
    }

    /// Frame backing region page `page_index`
    pub fn physical_page(&self, page_index: usize) -> Option<PhysicalPage> {
        self.vmobject()
            .physical_page(self.translate_to_vmobject_page(page_index))
    }

    // ========================================================================
    // Copy-on-write and accounting
    // ========================================================================

    /// Whether a write to region page `page_index` must copy first
    pub fn should_cow(&self, page_index: usize) -> bool {
        let vmobject = self.vmobject();
        if !vmobject.is_anonymous() {
            return false;
        }
        vmobject.should_cow(self.translate_to_vmobject_page(page_index), self.is_shared())
    }

    pub fn set_should_cow(&self, page_index: usize, cow: bool) {
        assert!(!self.is_shared(), "Region: set_should_cow on a shared region");
        let vmobject = self.vmobject();
        if vmobject.is_anonymous() {
            vmobject.set_should_cow(self.translate_to_vmobject_page(page_index), cow);
        }
    }

    pub fn cow_pages(&self) -> usize {
        let vmobject = self.vmobject();
        if !vmobject.is_anonymous() {
            return 0;
        }
        vmobject.cow_pages()
    }

    /// Bytes of real frames backing this region
    pub fn amount_resident(&self) -> usize {
        self.count_pages(|page| !page.is_sentinel()) * PAGE_SIZE
    }

    /// Bytes of real frames also referenced elsewhere
    pub fn amount_shared(&self) -> usize {
        self.count_pages(|page| !page.is_sentinel() && page.ref_count() > 1) * PAGE_SIZE
    }

    fn count_pages<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&PhysicalPage) -> bool,
    {
        let vmobject = self.vmobject();
        let state = vmobject.lock();
        (0..self.page_count())
            .filter_map(|i| state.physical_page(self.translate_to_vmobject_page(i)))
            .filter(|page| f(page))
            .count()
    }

    // ========================================================================
    // Cloning and retargeting
    // ========================================================================

    /// Clone this region for a forked address space
    ///
    /// Shared regions share their object; private ones get a copy-on-write
    /// clone of it and remap themselves so their own writes fault too.
    pub fn try_clone(&self) -> VmResult<Arc<Region>> {
        let vmobject = self.vmobject();
        let cacheable = if self.cacheable { Cacheable::Yes } else { Cacheable::No };

        if self.is_shared() {
            assert!(!self.is_stack(), "Region: shared stack region");
            if vmobject.is_inode() {
                assert!(vmobject.is_shared_inode(), "Region: shared region over a private inode");
            }
            let region = Region::try_create_user_accessible(
                &self.mm,
                self.range,
                vmobject,
                self.offset_in_vmobject,
                self.name(),
                self.access(),
                cacheable,
                true,
            )?;
            region.set_mmap(self.is_mmap());
            region.set_shared(true);
            region.set_syscall_region(self.is_syscall_region());
            return Ok(region);
        }

        if vmobject.is_inode() {
            assert!(vmobject.is_private_inode(), "Region: private region over a shared inode");
        }

        let vmobject_clone = vmobject.try_clone()?;
        log::debug!("Region: cloned {} for copy-on-write", self);

        self.remap();
        let clone_region = Region::try_create_user_accessible(
            &self.mm,
            self.range,
            vmobject_clone,
            self.offset_in_vmobject,
            self.name(),
            self.access(),
            cacheable,
            false,
        )?;
        if self.is_stack() {
            assert!(self.is_readable() && self.is_writable(), "Region: stack without read/write");
            assert!(vmobject.is_anonymous(), "Region: stack over an inode object");
            clone_region.set_stack(true);
        }
        clone_region.set_syscall_region(self.is_syscall_region());
        clone_region.set_mmap(self.is_mmap());
        Ok(clone_region)
    }

    /// Point this region at another object
    pub fn set_vmobject(&self, vmobject: Arc<VmObject>) {
        let mut current = self.vmobject.lock();
        if Arc::ptr_eq(&current, &vmobject) {
            return;
        }
        assert!(
            self.offset_in_vmobject as u64 + self.size() <= vmobject.size(),
            "Region: new object too small"
        );
        current.remove_region(self.id);
        vmobject.add_region(self.id, self.weak_self.clone());
        *current = vmobject;
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Install a translation for every page into `page_directory`
    ///
    /// Stops at the first page whose table cannot be allocated; partial
    /// installation is reported as failure.
    pub fn map(&self, page_directory: &Arc<PageDirectory>, should_flush_tlb: ShouldFlushTlb) -> VmResult<()> {
        {
            let _structural = self.mm.lock_structural();
            let mut current = self.page_directory.lock();
            assert!(
                current.as_ref().map_or(true, |pd| Arc::ptr_eq(pd, page_directory)),
                "Region: already mapped into another page directory"
            );
            *current = Some(page_directory.clone());
        }

        let vmobject = self.vmobject();
        if self.is_user() && !self.is_shared() {
            assert!(!vmobject.is_shared_inode(), "Region: private mapping of a shared inode");
        }

        let state = vmobject.lock();
        let mut tables = page_directory.lock();
        let count = self.page_count();
        let mut page_index = 0;
        while page_index < count {
            if !self.map_individual_page_impl(&mut tables, &vmobject, &state, page_index) {
                break;
            }
            page_index += 1;
        }
        if page_index > 0 && should_flush_tlb == ShouldFlushTlb::Yes {
            tables.flush_tlb(self.vaddr(), page_index);
        }
        if page_index == count {
            Ok(())
        } else {
            Err(VmError::PageTableExhausted(self.vaddr_from_page_index(page_index)))
        }
    }

    /// Map again into the current page directory, if any
    pub fn remap(&self) {
        if let Some(page_directory) = self.page_directory() {
            if let Err(err) = self.map(&page_directory, ShouldFlushTlb::Yes) {
                log::warn!("Region: remap of {} failed: {}", self, err);
            }
        }
    }

    /// Remove every translation and forget the page directory
    pub fn unmap(&self, deallocate_range: ShouldDeallocateVirtualMemoryRange) {
        let _structural = self.mm.lock_structural();
        let Some(page_directory) = self.page_directory.lock().take() else {
            return;
        };
        let mut tables = page_directory.lock();
        let count = self.page_count();
        for i in 0..count {
            tables.release_pte(self.vaddr_from_page_index(i), i == count - 1);
        }
        tables.flush_tlb(self.vaddr(), count);
        if deallocate_range == ShouldDeallocateVirtualMemoryRange::Yes {
            if tables.range_allocator().contains(&self.range) {
                tables.range_allocator().deallocate(self.range);
            } else if tables.identity_range_allocator().contains(&self.range) {
                tables.identity_range_allocator().deallocate(self.range);
            }
        }
    }

    fn map_individual_page_impl(
        &self,
        tables: &mut PageTables,
        vmobject: &VmObject,
        state: &VmObjectState,
        page_index: usize,
    ) -> bool {
        let page_vaddr = self.vaddr_from_page_index(page_index);
        let user_allowed = page_vaddr.get() >= USER_RANGE_BASE && is_user_address(page_vaddr.get());
        if self.is_mmap() && !user_allowed {
            panic!("Region: about to map mmap'ed page at a kernel address");
        }

        let vmobject_page_index = self.translate_to_vmobject_page(page_index);
        let Some(pte) = tables.ensure_pte(page_vaddr) else {
            return false;
        };
        match state.physical_page(vmobject_page_index) {
            Some(page) if self.is_readable() || self.is_writable() => {
                pte.set_cache_disabled(!self.cacheable);
                pte.set_physical_page_base(page.paddr());
                pte.set_present(true);
                let cow = page.is_sentinel()
                    || (vmobject.is_anonymous()
                        && vmobject.should_cow_locked(state, vmobject_page_index, self.is_shared()));
                pte.set_writable(!cow && self.is_writable());
                pte.set_execute_disabled(!self.is_executable());
                pte.set_user_allowed(user_allowed);
            }
            _ => pte.clear(),
        }
        true
    }

    /// Reinstall object page `vmobject_page_index` in this region
    ///
    /// Caller holds the object lock. Pages outside the region's window, or
    /// an unmapped region, succeed trivially.
    pub(crate) fn remap_vmobject_page(
        &self,
        state: &VmObjectState,
        vmobject_page_index: usize,
        should_flush_tlb: ShouldFlushTlb,
    ) -> bool {
        let Some(page_directory) = self.page_directory() else {
            return true;
        };
        let Some(page_index) = self.translate_vmobject_page(vmobject_page_index) else {
            return true;
        };
        let vmobject = self.vmobject();
        let mut tables = page_directory.lock();
        let success = self.map_individual_page_impl(&mut tables, &vmobject, state, page_index);
        if should_flush_tlb == ShouldFlushTlb::Yes {
            tables.flush_tlb(self.vaddr_from_page_index(page_index), 1);
        }
        success
    }

    /// Reinstall object pages `base..base + count` that fall in this region
    pub(crate) fn remap_vmobject_page_range(&self, state: &VmObjectState, base: usize, count: usize) -> bool {
        let Some(page_directory) = self.page_directory() else {
            return true;
        };
        let first = self.first_page_index();
        let begin = base.max(first);
        let end = (base + count).min(first + self.page_count());
        if begin >= end {
            return true;
        }

        let vmobject = self.vmobject();
        let mut tables = page_directory.lock();
        let mut success = true;
        for vmobject_page_index in begin..end {
            if !self.map_individual_page_impl(&mut tables, &vmobject, state, vmobject_page_index - first) {
                success = false;
                break;
            }
        }
        tables.flush_tlb(self.vaddr_from_page_index(begin - first), end - begin);
        success
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.vmobject.get_mut().remove_region(self.id);
        self.unmap(ShouldDeallocateVirtualMemoryRange::Yes);
        self.mm.unregister_region(self.id);
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Region({})[{} - {}]",
            self.name().unwrap_or("-"),
            self.vaddr(),
            self.range.end()
        )
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("range", &self.range)
            .field("access", &self.access())
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::anonymous::AllocationStrategy;
    use crate::vm::vm_resident::FramePool;

    const BASE: u64 = 0x1000_0000;

    fn setup(frames: usize) -> (Arc<MemoryManager>, Arc<PageDirectory>) {
        let mm = MemoryManager::new(Arc::new(FramePool::new(frames)));
        (mm, Arc::new(PageDirectory::unbounded()))
    }

    fn allocate_range(pd: &PageDirectory, pages: usize) -> VirtualRange {
        let range = VirtualRange::new(VirtualAddress::new(BASE), (pages * PAGE_SIZE) as u64);
        pd.lock().range_allocator().allocate_specific(range).unwrap()
    }

    fn anonymous(mm: &MemoryManager, pages: usize, strategy: AllocationStrategy) -> Arc<VmObject> {
        VmObject::try_create_with_size(mm, (pages * PAGE_SIZE) as u64, strategy).unwrap()
    }

    #[test]
    fn test_create_validates_range() {
        let (mm, _pd) = setup(4);
        let object = anonymous(&mm, 2, AllocationStrategy::None);
        let rw = Access::READ | Access::WRITE;

        let unaligned = VirtualRange::new(VirtualAddress::new(BASE + 1), PAGE_SIZE as u64);
        assert_eq!(
            Region::try_create_user_accessible(&mm, unaligned, object.clone(), 0, None, rw, Cacheable::Yes, false).err(),
            Some(VmError::InvalidRange)
        );
        let too_big = VirtualRange::new(VirtualAddress::new(BASE), 3 * PAGE_SIZE as u64);
        assert!(Region::try_create_user_accessible(&mm, too_big, object.clone(), 0, None, rw, Cacheable::Yes, false).is_err());
        assert_eq!(object.region_count(), 0);

        let ok = VirtualRange::new(VirtualAddress::new(BASE), PAGE_SIZE as u64);
        let region =
            Region::try_create_user_accessible(&mm, ok, object.clone(), PAGE_SIZE, Some("heap"), rw, Cacheable::Yes, false)
                .unwrap();
        assert_eq!(object.region_count(), 1);
        assert_eq!(region.first_page_index(), 1);
        assert_eq!(region.name(), Some("heap"));
        assert!(region.is_user());
        drop(region);
        assert_eq!(object.region_count(), 0);
    }

    #[test]
    fn test_map_installs_read_only_sentinels() {
        let (mm, pd) = setup(4);
        let object = anonymous(&mm, 2, AllocationStrategy::None);
        let range = allocate_range(&pd, 2);
        let region = Region::try_create_user_accessible(
            &mm,
            range,
            object,
            0,
            None,
            Access::READ | Access::WRITE,
            Cacheable::Yes,
            false,
        )
        .unwrap();
        region.map(&pd, ShouldFlushTlb::Yes).unwrap();

        let pte = pd.entry(range.base()).unwrap();
        assert!(pte.is_present());
        assert!(!pte.is_writable());
        assert!(pte.is_user_allowed());
        assert!(pte.is_execute_disabled());
        assert!(!pte.is_cache_disabled());
        assert_eq!(region.amount_resident(), 0);

        region.unmap(ShouldDeallocateVirtualMemoryRange::No);
        assert!(!region.is_mapped());
        assert!(pd.entry(range.base()).is_none());
    }

    #[test]
    fn test_map_reports_partial_failure() {
        let mm = MemoryManager::new(Arc::new(FramePool::new(4)));
        let pd = Arc::new(PageDirectory::new(1));
        let object = anonymous(&mm, 2, AllocationStrategy::None);
        // Straddles a 4MB page-table boundary
        let range = VirtualRange::new(VirtualAddress::new(BASE + 0x3F_F000), 2 * PAGE_SIZE as u64);
        pd.lock().range_allocator().allocate_specific(range).unwrap();
        let region =
            Region::try_create_user_accessible(&mm, range, object, 0, None, Access::READ, Cacheable::No, false).unwrap();
        assert_eq!(
            region.map(&pd, ShouldFlushTlb::Yes),
            Err(VmError::PageTableExhausted(VirtualAddress::new(BASE + 0x40_0000)))
        );
        assert!(pd.entry(range.base()).unwrap().is_cache_disabled());
    }

    #[test]
    fn test_no_access_clears_entry() {
        let (mm, pd) = setup(4);
        let object = anonymous(&mm, 1, AllocationStrategy::AllocateNow);
        let range = allocate_range(&pd, 1);
        let region =
            Region::try_create_user_accessible(&mm, range, object, 0, None, Access::empty(), Cacheable::Yes, false)
                .unwrap();
        region.map(&pd, ShouldFlushTlb::No).unwrap();
        assert!(!pd.entry(range.base()).unwrap().is_present());
    }

    #[test]
    #[should_panic]
    fn test_mmap_region_at_kernel_address() {
        let (mm, pd) = setup(4);
        let object = anonymous(&mm, 1, AllocationStrategy::None);
        let range = VirtualRange::new(VirtualAddress::new(KERNEL_BASE), PAGE_SIZE as u64);
        let region =
            Region::try_create_kernel_only(&mm, range, object, 0, None, Access::READ, Cacheable::Yes).unwrap();
        region.set_mmap(true);
        let _ = region.map(&pd, ShouldFlushTlb::Yes);
    }

    #[test]
    fn test_access_history() {
        let (mm, _pd) = setup(4);
        let object = anonymous(&mm, 1, AllocationStrategy::None);
        let range = VirtualRange::new(VirtualAddress::new(BASE), PAGE_SIZE as u64);
        let region = Region::try_create_user_accessible(
            &mm,
            range,
            object,
            0,
            None,
            Access::READ | Access::WRITE,
            Cacheable::Yes,
            false,
        )
        .unwrap();
        region.set_writable(false);
        region.set_executable(true);
        assert_eq!(region.access(), Access::READ | Access::EXECUTE);
        assert_eq!(region.max_access(), Access::READ | Access::WRITE | Access::EXECUTE);
    }

    #[test]
    fn test_set_vmobject_moves_registration() {
        let (mm, _pd) = setup(4);
        let first = anonymous(&mm, 1, AllocationStrategy::None);
        let second = anonymous(&mm, 1, AllocationStrategy::None);
        let range = VirtualRange::new(VirtualAddress::new(BASE), PAGE_SIZE as u64);
        let region =
            Region::try_create_user_accessible(&mm, range, first.clone(), 0, None, Access::READ, Cacheable::Yes, false)
                .unwrap();
        region.set_vmobject(second.clone());
        assert_eq!(first.region_count(), 0);
        assert_eq!(second.region_count(), 1);
        assert!(Arc::ptr_eq(&region.vmobject(), &second));
    }

    #[test]
    fn test_name_is_truncated() {
        let long = "x".repeat(100);
        assert_eq!(make_name(&long).len(), REGION_NAME_MAX);
    }
}
