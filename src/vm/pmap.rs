//! Physical Map - Page Directory and Virtual Range Allocation
//!
//! The page directory is a collaborator of the VM core. Regions install and
//! remove page table entries through it; it never looks at VM objects.
//!
//! The hosted directory is a sparse two-level table: one directory slot per
//! 4MB, one [`PageTableEntry`] per page. Page tables are created on demand
//! up to a fixed budget so that running out of page-table memory can be
//! exercised.
//!
//! ## Key Operations
//!
//! - `ensure_pte`: Find or create the entry for a virtual address
//! - `release_pte`: Clear an entry, freeing its table on the last release
//! - `flush_tlb`: Invalidate translations for a range
//! - `range_allocator`: Virtual range bookkeeping for the address space

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::config::{KERNEL_BASE, PAGE_DIRECTORY_ENTRY_COUNT, PAGE_TABLE_ENTRY_COUNT, USER_RANGE_BASE};
use crate::types::{PhysicalAddress, VirtualAddress, VirtualRange};
use crate::vm::vm_page::{PAGE_SHIFT, PAGE_SIZE};

// ============================================================================
// Page Table Entry
// ============================================================================

bitflags! {
    /// Hardware bits of a page table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLED = 1 << 4;
        const NO_EXECUTE = 1 << 31;
    }
}

/// One page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    flags: PteFlags,
    physical_page_base: u64,
}

impl PageTableEntry {
    /// Reset to the not-present state
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_null(&self) -> bool {
        self.flags.is_empty() && self.physical_page_base == 0
    }

    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    pub fn is_present(&self) -> bool {
        self.flags.contains(PteFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    pub fn is_user_allowed(&self) -> bool {
        self.flags.contains(PteFlags::USER)
    }

    pub fn is_cache_disabled(&self) -> bool {
        self.flags.contains(PteFlags::CACHE_DISABLED)
    }

    pub fn is_execute_disabled(&self) -> bool {
        self.flags.contains(PteFlags::NO_EXECUTE)
    }

    pub fn physical_page_base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.physical_page_base)
    }

    pub fn set_physical_page_base(&mut self, paddr: PhysicalAddress) {
        self.physical_page_base = paddr.page_base().get();
    }

    pub fn set_present(&mut self, present: bool) {
        self.flags.set(PteFlags::PRESENT, present);
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.flags.set(PteFlags::WRITABLE, writable);
    }

    pub fn set_user_allowed(&mut self, allowed: bool) {
        self.flags.set(PteFlags::USER, allowed);
    }

    pub fn set_cache_disabled(&mut self, disabled: bool) {
        self.flags.set(PteFlags::CACHE_DISABLED, disabled);
    }

    pub fn set_execute_disabled(&mut self, disabled: bool) {
        self.flags.set(PteFlags::NO_EXECUTE, disabled);
    }
}

struct PageTable {
    entries: Box<[PageTableEntry; PAGE_TABLE_ENTRY_COUNT]>,
}

impl PageTable {
    fn new() -> Self {
        Self {
            entries: Box::new([PageTableEntry::default(); PAGE_TABLE_ENTRY_COUNT]),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(PageTableEntry::is_null)
    }
}

const fn directory_index(vaddr: VirtualAddress) -> usize {
    ((vaddr.get() >> PAGE_SHIFT) as usize / PAGE_TABLE_ENTRY_COUNT) % PAGE_DIRECTORY_ENTRY_COUNT
}

const fn table_index(vaddr: VirtualAddress) -> usize {
    (vaddr.get() >> PAGE_SHIFT) as usize % PAGE_TABLE_ENTRY_COUNT
}

// ============================================================================
// Range Allocator
// ============================================================================

/// First-fit allocator over a fixed virtual range
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    total: VirtualRange,
    /// Free ranges, sorted and never adjacent
    available: Vec<VirtualRange>,
}

impl RangeAllocator {
    pub fn new(total: VirtualRange) -> Self {
        let mut available = Vec::new();
        if total.size() > 0 {
            available.push(total);
        }
        Self { total, available }
    }

    pub fn total_range(&self) -> VirtualRange {
        self.total
    }

    /// Whether `range` lies inside the managed range
    pub fn contains(&self, range: &VirtualRange) -> bool {
        self.total.contains_range(range)
    }

    /// Allocate `size` bytes anywhere
    pub fn allocate_anywhere(&mut self, size: u64) -> Option<VirtualRange> {
        if size == 0 || size % PAGE_SIZE as u64 != 0 {
            return None;
        }
        let index = self.available.iter().position(|r| r.size() >= size)?;
        let free = self.available[index];
        let allocated = VirtualRange::new(free.base(), size);
        if free.size() == size {
            self.available.remove(index);
        } else {
            self.available[index] = VirtualRange::new(free.base().offset(size), free.size() - size);
        }
        Some(allocated)
    }

    /// Allocate exactly `range`, failing if any part of it is taken
    pub fn allocate_specific(&mut self, range: VirtualRange) -> Option<VirtualRange> {
        if range.size() == 0 || !range.base().is_page_aligned() {
            return None;
        }
        let index = self.available.iter().position(|r| r.contains_range(&range))?;
        let free = self.available.remove(index);
        let before = range.base().get() - free.base().get();
        let after = free.end().get() - range.end().get();
        if after > 0 {
            self.available.insert(index, VirtualRange::new(range.end(), after));
        }
        if before > 0 {
            self.available.insert(index, VirtualRange::new(free.base(), before));
        }
        Some(range)
    }

    /// Return `range` to the free list
    pub fn deallocate(&mut self, range: VirtualRange) {
        assert!(self.contains(&range), "RangeAllocator: deallocating foreign range");
        assert!(
            !self.available.iter().any(|r| r.overlaps(&range)),
            "RangeAllocator: double free of {:?}",
            range
        );
        let index = self
            .available
            .iter()
            .position(|r| r.base() > range.base())
            .unwrap_or(self.available.len());
        self.available.insert(index, range);

        // Merge with the following and preceding neighbours
        if index + 1 < self.available.len() && self.available[index].end() == self.available[index + 1].base() {
            let next = self.available.remove(index + 1);
            let current = self.available[index];
            self.available[index] = VirtualRange::new(current.base(), current.size() + next.size());
        }
        if index > 0 && self.available[index - 1].end() == self.available[index].base() {
            let current = self.available.remove(index);
            let prev = self.available[index - 1];
            self.available[index - 1] = VirtualRange::new(prev.base(), prev.size() + current.size());
        }
    }

    /// Total free bytes
    pub fn available_size(&self) -> u64 {
        self.available.iter().map(VirtualRange::size).sum()
    }
}

// ============================================================================
// Page Directory
// ============================================================================

/// Page tables of one address space, reached through [`PageDirectory::lock`]
pub struct PageTables {
    tables: BTreeMap<usize, PageTable>,
    max_tables: usize,
    tlb_flushes: u64,
    range_allocator: RangeAllocator,
    identity_range_allocator: RangeAllocator,
}

impl PageTables {
    /// Find or create the entry for `vaddr`
    ///
    /// `None` when a new page table would exceed the table budget.
    pub fn ensure_pte(&mut self, vaddr: VirtualAddress) -> Option<&mut PageTableEntry> {
        let dir = directory_index(vaddr);
        if !self.tables.contains_key(&dir) {
            if self.tables.len() >= self.max_tables {
                log::warn!("PageDirectory: no page table available for {}", vaddr);
                return None;
            }
            self.tables.insert(dir, PageTable::new());
        }
        let table = self.tables.get_mut(&dir)?;
        Some(&mut table.entries[table_index(vaddr)])
    }

    /// Clear the entry for `vaddr`
    ///
    /// On the last release of a batch, a table left with no entries is freed.
    pub fn release_pte(&mut self, vaddr: VirtualAddress, is_last_release: bool) {
        let dir = directory_index(vaddr);
        let Some(table) = self.tables.get_mut(&dir) else {
            return;
        };
        table.entries[table_index(vaddr)].clear();
        if is_last_release && table.is_empty() {
            self.tables.remove(&dir);
        }
    }

    /// Copy of the entry for `vaddr`, if its page table exists
    pub fn entry(&self, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        self.tables
            .get(&directory_index(vaddr))
            .map(|table| table.entries[table_index(vaddr)])
    }

    /// Invalidate `page_count` pages starting at `vaddr`
    pub fn flush_tlb(&mut self, vaddr: VirtualAddress, page_count: usize) {
        log::trace!("PageDirectory: flush {} pages at {}", page_count, vaddr);
        self.tlb_flushes += 1;
    }

    pub fn tlb_flush_count(&self) -> u64 {
        self.tlb_flushes
    }

    pub fn page_table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn range_allocator(&mut self) -> &mut RangeAllocator {
        &mut self.range_allocator
    }

    pub fn identity_range_allocator(&mut self) -> &mut RangeAllocator {
        &mut self.identity_range_allocator
    }
}

/// Page directory of one address space
pub struct PageDirectory {
    tables: Mutex<PageTables>,
}

impl PageDirectory {
    /// Create a user address space with room for `max_page_tables` tables
    pub fn new(max_page_tables: usize) -> Self {
        let user = VirtualRange::new(VirtualAddress::new(USER_RANGE_BASE), KERNEL_BASE - USER_RANGE_BASE);
        let identity = VirtualRange::new(VirtualAddress::new(0), USER_RANGE_BASE);
        Self {
            tables: Mutex::new(PageTables {
                tables: BTreeMap::new(),
                max_tables: max_page_tables,
                tlb_flushes: 0,
                range_allocator: RangeAllocator::new(user),
                identity_range_allocator: RangeAllocator::new(identity),
            }),
        }
    }

    /// Create an address space with no page table budget limit
    pub fn unbounded() -> Self {
        Self::new(PAGE_DIRECTORY_ENTRY_COUNT)
    }

    /// Take the page directory lock
    pub fn lock(&self) -> MutexGuard<'_, PageTables> {
        self.tables.lock()
    }

    /// Copy of the entry for `vaddr`
    pub fn entry(&self, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        self.lock().entry(vaddr)
    }

    /// Physical address `vaddr` translates to, if present
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.entry(vaddr)?;
        if !entry.is_present() {
            return None;
        }
        let offset = vaddr.get() & (PAGE_SIZE as u64 - 1);
        Some(PhysicalAddress::new(entry.physical_page_base().get() + offset))
    }
}
