//! Anonymous VM Objects
//!
//! Anonymous memory is backed by no file. Its pages start out either as
//! real frames, as lazy-commit sentinels reserved against the global commit
//! budget, or as the shared zero frame. Cloning for fork shares every frame
//! copy-on-write and reserves enough frames up front that the copies of
//! non-volatile pages can never fail.
//!
//! ## Allocation strategies
//!
//! - `AllocateNow`: commit and allocate every page immediately
//! - `Reserve`: commit every page, allocate on first touch
//! - `None`: map the shared zero frame, allocate on first write

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{COMMIT_DEBUG, PAGE_FAULT_DEBUG};
use crate::error::{CopyFault, VmError, VmResult};
use crate::types::{PhysicalAddress, VirtualAddress};
use crate::vm::cow::{CommittedCowPages, CowMap};
use crate::vm::memory_manager::MemoryManager;
use crate::vm::purgeable::{PurgeablePageRanges, VolatilePageRange, VolatilePageRanges};
use crate::vm::vm_fault::PageFaultResponse;
use crate::vm::vm_object::{VmObject, VmObjectKind, VmObjectState};
use crate::vm::vm_page::{page_count_for, PhysicalPage, PAGE_SIZE};
use crate::vm::vm_resident::ShouldZeroFill;

/// How an anonymous object backs its pages at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Commit and allocate every page immediately
    AllocateNow,
    /// Commit every page, allocate on first touch
    Reserve,
    /// Share the zero frame, nothing committed
    None,
}

// ============================================================================
// Anonymous State
// ============================================================================

/// Anonymous-only part of the object state
pub(crate) struct AnonymousState {
    /// Pages that must be copied before a private write; `None` means none
    pub(crate) cow_map: Option<CowMap>,
    /// Committed pages still held as lazy-commit sentinels
    pub(crate) unused_committed_pages: usize,
    nonvolatile_cache: VolatilePageRanges,
    nonvolatile_cache_dirty: bool,
    purgeable_ranges: Vec<Arc<PurgeablePageRanges>>,
    /// Reservation shared with a clone, dropped once seen empty
    pub(crate) shared_committed_cow_pages: Option<Arc<CommittedCowPages>>,
}

impl AnonymousState {
    fn new(page_count: usize, unused_committed_pages: usize) -> Self {
        Self {
            cow_map: None,
            unused_committed_pages,
            nonvolatile_cache: VolatilePageRanges::new(VolatilePageRange::new(0, page_count)),
            nonvolatile_cache_dirty: true,
            purgeable_ranges: Vec::new(),
            shared_committed_cow_pages: None,
        }
    }

    fn ensure_cow_map(&mut self, page_count: usize) -> &mut CowMap {
        self.cow_map.get_or_insert_with(|| CowMap::new(page_count, true))
    }

    fn ensure_or_reset_cow_map(&mut self, page_count: usize) {
        match self.cow_map.as_mut() {
            Some(map) => map.fill(true),
            None => self.cow_map = Some(CowMap::new(page_count, true)),
        }
    }

    /// Committed COW pool, dropping it if it has run dry
    fn committed_cow_pages(&mut self) -> Option<&Arc<CommittedCowPages>> {
        if self
            .shared_committed_cow_pages
            .as_ref()
            .map_or(false, |pool| pool.is_empty())
        {
            self.shared_committed_cow_pages = None;
        }
        self.shared_committed_cow_pages.as_ref()
    }
}

// ============================================================================
// Construction and cloning
// ============================================================================

impl VmObject {
    /// Create an anonymous object of `size` bytes
    pub fn try_create_with_size(
        mm: &MemoryManager,
        size: u64,
        strategy: AllocationStrategy,
    ) -> VmResult<Arc<VmObject>> {
        let allocator = mm.allocator();
        let page_count = page_count_for(size);

        if strategy != AllocationStrategy::None && !allocator.commit_user_physical_pages(page_count) {
            return Err(VmError::CommitFailed { pages: page_count });
        }

        let (physical_pages, unused_committed_pages) = match strategy {
            AllocationStrategy::AllocateNow => (
                (0..page_count)
                    .map(|_| Some(allocator.allocate_committed_user_physical_page(ShouldZeroFill::Yes)))
                    .collect(),
                0,
            ),
            AllocationStrategy::Reserve => (alloc::vec![Some(allocator.lazy_committed_page()); page_count], page_count),
            AllocationStrategy::None => (alloc::vec![Some(allocator.shared_zero_page()); page_count], 0),
        };

        if COMMIT_DEBUG {
            log::debug!(
                "VmObject: created anonymous object of {} pages ({:?}), {} reserved",
                page_count,
                strategy,
                unused_committed_pages
            );
        }

        let state = VmObjectState::new(
            physical_pages,
            Some(AnonymousState::new(page_count, unused_committed_pages)),
        );
        Ok(Arc::new(VmObject::new(allocator, VmObjectKind::Anonymous, state)))
    }

    /// Create an anonymous object over existing frames
    pub fn try_create_with_physical_pages(mm: &MemoryManager, pages: &[PhysicalPage]) -> VmResult<Arc<VmObject>> {
        let physical_pages = pages.iter().cloned().map(Some).collect();
        let state = VmObjectState::new(physical_pages, Some(AnonymousState::new(pages.len(), 0)));
        Ok(Arc::new(VmObject::new(mm.allocator(), VmObjectKind::Anonymous, state)))
    }

    /// Create an anonymous object over the fixed physical range at `paddr`
    pub fn try_create_for_physical_range(mm: &MemoryManager, paddr: PhysicalAddress, size: u64) -> VmResult<Arc<VmObject>> {
        if paddr.checked_offset(size).is_none() {
            log::warn!(
                "VmObject: physical range at {} of {:#x} bytes would wrap around",
                paddr,
                size
            );
            return Err(VmError::AddressWrap { base: paddr, size });
        }
        assert!(paddr.page_base() == paddr, "VmObject: physical range not page aligned");

        let page_count = page_count_for(size);
        let physical_pages = (0..page_count)
            .map(|i| Some(PhysicalPage::create(PhysicalAddress::new(paddr.get() + (i * PAGE_SIZE) as u64))))
            .collect();
        let state = VmObjectState::new(physical_pages, Some(AnonymousState::new(page_count, 0)));
        Ok(Arc::new(VmObject::new(mm.allocator(), VmObjectKind::Anonymous, state)))
    }

    /// Copy-on-write clone for fork
    ///
    /// Reserves one frame per non-volatile page so that every copy either
    /// side may need later is already paid for.
    pub(crate) fn try_clone_anonymous(&self) -> VmResult<Arc<VmObject>> {
        let mut state = self.lock();

        let need_cow_pages = self.nonvolatile_ranges_locked(&state).page_count();
        if COMMIT_DEBUG {
            log::debug!("VmObject {:?}: cloning, need {} committed cow pages", self.id(), need_cow_pages);
        }

        if !self.allocator().commit_user_physical_pages(need_cow_pages) {
            return Err(VmError::CommitFailed { pages: need_cow_pages });
        }
        let pool = Arc::new(CommittedCowPages::new(self.allocator(), need_cow_pages));

        let page_count = self.page_count();
        let anonymous = state.anonymous_mut();
        anonymous.shared_committed_cow_pages = Some(pool.clone());
        anonymous.ensure_or_reset_cow_map(page_count);

        // The reservation stays with the original; the clone gets zero pages
        let mut unused_committed_pages = anonymous.unused_committed_pages;
        let mut physical_pages = state.physical_pages.clone();
        if unused_committed_pages > 0 {
            let zero = self.allocator().shared_zero_page();
            for slot in physical_pages.iter_mut() {
                if slot.as_ref().map_or(false, PhysicalPage::is_lazy_committed_page) {
                    *slot = Some(zero.clone());
                    unused_committed_pages -= 1;
                    if unused_committed_pages == 0 {
                        break;
                    }
                }
            }
            assert_eq!(unused_committed_pages, 0, "VmObject: lazy pages out of sync with reservation");
        }

        let mut clone_state = AnonymousState::new(page_count, 0);
        clone_state.ensure_or_reset_cow_map(page_count);
        clone_state.shared_committed_cow_pages = Some(pool);

        Ok(Arc::new(VmObject::new(
            self.allocator(),
            VmObjectKind::Anonymous,
            VmObjectState::new(physical_pages, Some(clone_state)),
        )))
    }

    // ========================================================================
    // Commit accounting
    // ========================================================================

    /// Committed pages not yet turned into real frames
    pub fn unused_committed_pages(&self) -> usize {
        self.lock().anonymous().unused_committed_pages
    }

    /// Frames left in the pool shared with a clone, if any
    pub fn committed_cow_pages(&self) -> Option<usize> {
        self.lock()
            .anonymous()
            .shared_committed_cow_pages
            .as_ref()
            .map(|pool| pool.remaining())
    }

    /// Turn one reservation into a real frame for slot `page_index`
    pub(crate) fn allocate_committed_page(&self, state: &mut VmObjectState, page_index: usize) -> PhysicalPage {
        debug_assert!(
            !self.volatile_ranges_locked(state).contains(page_index),
            "VmObject: committed page requested for a volatile page"
        );
        let anonymous = state.anonymous_mut();
        assert!(anonymous.unused_committed_pages > 0, "VmObject: no committed pages left");
        anonymous.unused_committed_pages -= 1;
        self.allocator()
            .allocate_committed_user_physical_page(ShouldZeroFill::Yes)
    }

    // ========================================================================
    // Copy-on-write
    // ========================================================================

    /// Whether a write to `page_index` must copy first
    ///
    /// Sentinel frames always do. Otherwise shared mappings never do and
    /// private ones consult the COW bitmap.
    pub fn should_cow(&self, page_index: usize, is_shared: bool) -> bool {
        let state = self.lock();
        self.should_cow_locked(&state, page_index, is_shared)
    }

    pub(crate) fn should_cow_locked(&self, state: &VmObjectState, page_index: usize, is_shared: bool) -> bool {
        if state.physical_page(page_index).map_or(false, PhysicalPage::is_sentinel) {
            return true;
        }
        if is_shared {
            return false;
        }
        state
            .anonymous()
            .cow_map
            .as_ref()
            .map_or(false, |map| map.get(page_index))
    }

    pub fn set_should_cow(&self, page_index: usize, cow: bool) {
        let mut state = self.lock();
        self.set_should_cow_locked(&mut state, page_index, cow);
    }

    pub(crate) fn set_should_cow_locked(&self, state: &mut VmObjectState, page_index: usize, cow: bool) {
        let page_count = self.page_count();
        state.anonymous_mut().ensure_cow_map(page_count).set(page_index, cow);
    }

    /// Number of pages still marked copy-on-write
    pub fn cow_pages(&self) -> usize {
        self.lock()
            .anonymous()
            .cow_map
            .as_ref()
            .map_or(0, CowMap::count_set)
    }

    /// Give slot `page_index` a private frame
    ///
    /// Caller holds the object lock and re-installs the translation after.
    pub(crate) fn handle_cow_fault(
        &self,
        state: &mut VmObjectState,
        page_index: usize,
        vaddr: VirtualAddress,
    ) -> PageFaultResponse {
        let is_nonvolatile = self.is_nonvolatile(state, page_index);
        let pool = state.anonymous_mut().committed_cow_pages().cloned();
        let have_committed = pool.is_some() && is_nonvolatile;

        let ref_count = match state.physical_page(page_index) {
            Some(page) => page.ref_count(),
            None => panic!("VmObject: empty slot {} in anonymous object", page_index),
        };

        if ref_count == 1 {
            if PAGE_FAULT_DEBUG {
                log::trace!("    >> It's a COW page but nobody is sharing it anymore. Remap r/w");
            }
            self.set_should_cow_locked(state, page_index, false);
            if let Some(pool) = pool.filter(|_| have_committed) {
                if pool.return_one() {
                    state.anonymous_mut().shared_committed_cow_pages = None;
                }
            }
            return PageFaultResponse::Continue;
        }

        let committed = match pool.filter(|_| have_committed) {
            Some(pool) => {
                if PAGE_FAULT_DEBUG {
                    log::trace!("    >> It's a committed COW page and it's time to COW!");
                }
                let page = pool.allocate_one();
                if pool.is_empty() {
                    state.anonymous_mut().shared_committed_cow_pages = None;
                }
                page
            }
            None => None,
        };

        let page = match committed {
            Some(page) => page,
            None => {
                if PAGE_FAULT_DEBUG {
                    log::trace!("    >> It's a COW page and it's time to COW!");
                }
                match self.allocator().allocate_user_physical_page(ShouldZeroFill::No) {
                    Some(page) => page,
                    None => {
                        log::warn!("VmObject: handle_cow_fault was unable to allocate a physical page");
                        return PageFaultResponse::OutOfMemory;
                    }
                }
            }
        };

        let Some(source) = state.physical_page(page_index) else {
            panic!("VmObject: empty slot {} in anonymous object", page_index);
        };
        if PAGE_FAULT_DEBUG {
            log::trace!("      >> COW {} <- {}", page.paddr(), source.paddr());
        }
        if let Err(fault) = copy_frame(self, source, &page) {
            log::error!(
                "      >> COW: error copying page {}/{} to {}: {}",
                source.paddr(),
                vaddr,
                page.paddr(),
                fault
            );
            panic!("VmObject: fault while copying a COW page");
        }

        state.physical_pages[page_index] = Some(page);
        self.set_should_cow_locked(state, page_index, false);
        PageFaultResponse::Continue
    }

    // ========================================================================
    // Volatility
    // ========================================================================

    /// Register a client's volatility tracker
    pub fn register_purgeable_page_ranges(self: &Arc<Self>, tracker: &Arc<PurgeablePageRanges>) {
        let mut state = self.lock();
        let anonymous = state.anonymous_mut();
        assert!(
            !anonymous.purgeable_ranges.iter().any(|t| Arc::ptr_eq(t, tracker)),
            "VmObject: tracker registered twice"
        );
        assert!(
            tracker.volatile_ranges().total_range().range_end() <= self.page_count(),
            "VmObject: tracker larger than the object"
        );
        tracker.set_vmobject(Arc::downgrade(self));
        anonymous.purgeable_ranges.push(tracker.clone());
        self.volatile_set_changed(&mut state);
    }

    pub fn unregister_purgeable_page_ranges(&self, tracker: &Arc<PurgeablePageRanges>) {
        let mut state = self.lock();
        let anonymous = state.anonymous_mut();
        let Some(index) = anonymous.purgeable_ranges.iter().position(|t| Arc::ptr_eq(t, tracker)) else {
            panic!("VmObject: unregistering unknown tracker");
        };
        tracker.set_vmobject(alloc::sync::Weak::new());
        anonymous.purgeable_ranges.remove(index);
        self.volatile_set_changed(&mut state);
    }

    /// The tracker set changed, so the intersection may have grown
    fn volatile_set_changed(&self, state: &mut VmObjectState) {
        state.anonymous_mut().nonvolatile_cache_dirty = true;
        self.reclaim_lazy_pages(state, VolatilePageRange::new(0, self.page_count()));
    }

    /// Whether any registered tracker has a volatile range
    pub fn is_any_volatile(&self) -> bool {
        let state = self.lock();
        state
            .anonymous()
            .purgeable_ranges
            .iter()
            .any(|tracker| !tracker.is_empty())
    }

    /// Pages every registered tracker considers volatile
    pub fn volatile_ranges(&self) -> VolatilePageRanges {
        let state = self.lock();
        self.volatile_ranges_locked(&state)
    }

    pub(crate) fn volatile_ranges_locked(&self, state: &VmObjectState) -> VolatilePageRanges {
        let trackers = &state.anonymous().purgeable_ranges;
        let Some((first, rest)) = trackers.split_first() else {
            return VolatilePageRanges::new(VolatilePageRange::new(0, self.page_count()));
        };
        let mut result = first.volatile_ranges().clone();
        for tracker in rest {
            if result.is_empty() {
                break;
            }
            result = result.intersection(&tracker.volatile_ranges());
        }
        result
    }

    fn nonvolatile_ranges_locked(&self, state: &VmObjectState) -> VolatilePageRanges {
        self.volatile_ranges_locked(state).complement()
    }

    pub(crate) fn is_nonvolatile(&self, state: &mut VmObjectState, page_index: usize) -> bool {
        if state.anonymous().nonvolatile_cache_dirty {
            let cache = self.nonvolatile_ranges_locked(state);
            let anonymous = state.anonymous_mut();
            anonymous.nonvolatile_cache = cache;
            anonymous.nonvolatile_cache_dirty = false;
        }
        state.anonymous().nonvolatile_cache.contains(page_index)
    }

    /// A tracker declared `range` volatile
    ///
    /// Reservations for lazy pages that are now volatile everywhere are
    /// handed back to the global budget.
    pub(crate) fn range_made_volatile(&self, state: &mut VmObjectState, range: VolatilePageRange) {
        state.anonymous_mut().nonvolatile_cache_dirty = true;
        self.reclaim_lazy_pages(state, range);
    }

    /// Uncommit lazy pages inside `range` that are volatile everywhere
    fn reclaim_lazy_pages(&self, state: &mut VmObjectState, range: VolatilePageRange) {
        if state.anonymous().unused_committed_pages == 0 {
            return;
        }

        let volatile = self.volatile_ranges_locked(state);
        let mut uncommit_page_count = 0;
        for r in volatile.ranges() {
            let intersected = range.intersected(r);
            if intersected.is_empty() {
                continue;
            }
            let removed = self.remove_lazy_commit_pages(state, intersected);
            if removed > 0 {
                uncommit_page_count += removed;
                self.remap_page_range(state, intersected.base, intersected.count);
            }
            if state.anonymous().unused_committed_pages == 0 {
                break;
            }
        }

        if uncommit_page_count > 0 {
            if COMMIT_DEBUG {
                log::debug!(
                    "VmObject {:?}: uncommit {} lazy-commit pages",
                    self.id(),
                    uncommit_page_count
                );
            }
            self.allocator().uncommit_user_physical_pages(uncommit_page_count);
        }
    }

    /// A tracker declared `range` non-volatile
    ///
    /// Nothing is re-committed here; pages are paid for when touched.
    pub(crate) fn range_made_nonvolatile(&self, state: &mut VmObjectState, _range: VolatilePageRange) {
        state.anonymous_mut().nonvolatile_cache_dirty = true;
    }

    fn remove_lazy_commit_pages(&self, state: &mut VmObjectState, range: VolatilePageRange) -> usize {
        let zero = self.allocator().shared_zero_page();
        let VmObjectState {
            physical_pages,
            anonymous,
        } = state;
        let Some(anonymous) = anonymous.as_mut() else {
            return 0;
        };

        let mut removed = 0;
        let end = range.range_end().min(physical_pages.len());
        for slot in &mut physical_pages[range.base..end] {
            if slot.as_ref().map_or(false, PhysicalPage::is_lazy_committed_page) {
                *slot = Some(zero.clone());
                removed += 1;
                assert!(anonymous.unused_committed_pages > 0);
                anonymous.unused_committed_pages -= 1;
                if anonymous.unused_committed_pages == 0 {
                    break;
                }
            }
        }
        removed
    }

    /// Discard every real frame in a volatile range
    ///
    /// Lazy pages found there are uncommitted rather than counted. Returns
    /// the number of frames released.
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        self.reclaim_lazy_pages(&mut state, VolatilePageRange::new(0, self.page_count()));
        let volatile = self.volatile_ranges_locked(&state);
        let zero = self.allocator().shared_zero_page();

        let mut purged_page_count = 0;
        for range in volatile.ranges() {
            let mut purged_in_range = 0;
            let end = range.range_end().min(state.physical_pages.len());
            for slot in &mut state.physical_pages[range.base..end] {
                if slot.as_ref().map_or(false, |page| !page.is_sentinel()) {
                    purged_in_range += 1;
                }
                *slot = Some(zero.clone());
            }

            if purged_in_range > 0 {
                purged_page_count += purged_in_range;
                self.set_was_purged(&state, range);
                self.for_each_region(|region| {
                    log::info!(
                        "Purged {} pages from region {} at {} - {}",
                        purged_in_range,
                        region.name().unwrap_or("(anonymous)"),
                        region.vaddr_from_page_index(range.base),
                        region.vaddr_from_page_index(range.range_end())
                    );
                    region.remap_vmobject_page_range(&state, range.base, range.count);
                });
            }
        }
        purged_page_count
    }

    fn set_was_purged(&self, state: &VmObjectState, range: &VolatilePageRange) {
        for tracker in &state.anonymous().purgeable_ranges {
            tracker.set_was_purged(range);
        }
    }
}

/// Copy one frame into another through the quickmap window
fn copy_frame(vmobject: &VmObject, source: &PhysicalPage, destination: &PhysicalPage) -> Result<(), CopyFault> {
    let allocator = vmobject.allocator();
    let source = allocator.quickmap_page(source).map_err(|_| CopyFault::Source)?;
    let mut destination = allocator.quickmap_page(destination).map_err(|_| CopyFault::Destination)?;
    destination.copy_from_slice(&source[..]);
    Ok(())
}
