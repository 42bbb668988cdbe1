//! VM Object - Memory Object Management
//!
//! A VM object owns an ordered list of physical page slots and knows which
//! regions currently map it. Regions map windows of it; the object pushes
//! slot changes out to every one of them through `remap_page`.
//!
//! The object kinds form a closed set:
//!
//! - `Anonymous`: zero-filled memory with commit accounting, copy-on-write
//!   cloning and volatile ranges
//! - `SharedInode`: file-backed, one object for all mappings of the file
//! - `PrivateInode`: file-backed, private slots per mapping
//!
//! ## Locking
//!
//! Everything that touches the slots goes through [`VmObject::lock`]. Code
//! that needs the slots and a page directory takes the object lock first.
//! The region registry has its own lock and is only held while the
//! registry itself is read or changed.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::error::VmResult;
use crate::types::{RegionId, VmObjectId};
use crate::vm::anonymous::AnonymousState;
use crate::vm::inode::Inode;
use crate::vm::region::{Region, ShouldFlushTlb};
use crate::vm::vm_page::{PhysicalPage, PAGE_SIZE};
use crate::vm::vm_resident::FrameAllocator;

// ============================================================================
// Object Kind
// ============================================================================

/// Backing of a VM object
#[derive(Clone)]
pub enum VmObjectKind {
    Anonymous,
    SharedInode(Arc<dyn Inode>),
    PrivateInode(Arc<dyn Inode>),
}

impl VmObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            VmObjectKind::Anonymous => "anonymous",
            VmObjectKind::SharedInode(_) => "shared-inode",
            VmObjectKind::PrivateInode(_) => "private-inode",
        }
    }
}

// ============================================================================
// Object State
// ============================================================================

/// Lock-protected contents of a VM object
pub struct VmObjectState {
    /// One slot per page; anonymous slots are never empty
    pub(crate) physical_pages: Vec<Option<PhysicalPage>>,
    /// Present exactly for anonymous objects
    pub(crate) anonymous: Option<AnonymousState>,
}

impl VmObjectState {
    pub(crate) fn new(physical_pages: Vec<Option<PhysicalPage>>, anonymous: Option<AnonymousState>) -> Self {
        Self {
            physical_pages,
            anonymous,
        }
    }

    pub fn page_count(&self) -> usize {
        self.physical_pages.len()
    }

    /// Frame in slot `index`
    pub fn physical_page(&self, index: usize) -> Option<&PhysicalPage> {
        self.physical_pages.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn anonymous(&self) -> &AnonymousState {
        match self.anonymous.as_ref() {
            Some(anonymous) => anonymous,
            None => panic!("VmObject: anonymous state requested on an inode object"),
        }
    }

    pub(crate) fn anonymous_mut(&mut self) -> &mut AnonymousState {
        match self.anonymous.as_mut() {
            Some(anonymous) => anonymous,
            None => panic!("VmObject: anonymous state requested on an inode object"),
        }
    }
}

// ============================================================================
// VM Object
// ============================================================================

/// A pageable memory object
pub struct VmObject {
    id: VmObjectId,
    allocator: Arc<dyn FrameAllocator>,
    kind: VmObjectKind,
    page_count: usize,
    state: Mutex<VmObjectState>,
    /// Regions mapping this object; entries never keep a region alive
    regions: Mutex<Vec<(RegionId, Weak<Region>)>>,
}

impl VmObject {
    pub(crate) fn new(allocator: Arc<dyn FrameAllocator>, kind: VmObjectKind, state: VmObjectState) -> Self {
        Self {
            id: VmObjectId::new(),
            allocator,
            kind,
            page_count: state.page_count(),
            state: Mutex::new(state),
            regions: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub fn kind(&self) -> &VmObjectKind {
        &self.kind
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        (self.page_count * PAGE_SIZE) as u64
    }

    pub fn allocator(&self) -> Arc<dyn FrameAllocator> {
        self.allocator.clone()
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, VmObjectKind::Anonymous)
    }

    pub fn is_inode(&self) -> bool {
        !self.is_anonymous()
    }

    pub fn is_shared_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::SharedInode(_))
    }

    pub fn is_private_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::PrivateInode(_))
    }

    pub fn inode(&self) -> Option<&Arc<dyn Inode>> {
        match &self.kind {
            VmObjectKind::SharedInode(inode) | VmObjectKind::PrivateInode(inode) => Some(inode),
            VmObjectKind::Anonymous => None,
        }
    }

    /// Take the object lock
    pub fn lock(&self) -> MutexGuard<'_, VmObjectState> {
        self.state.lock()
    }

    /// Handle to the frame in slot `index`
    pub fn physical_page(&self, index: usize) -> Option<PhysicalPage> {
        self.lock().physical_page(index).cloned()
    }

    /// Reference count of the frame in slot `index`, 0 when empty
    pub fn page_ref_count(&self, index: usize) -> usize {
        self.lock().physical_page(index).map_or(0, PhysicalPage::ref_count)
    }

    /// Independent copy of this object
    pub fn try_clone(self: &Arc<Self>) -> VmResult<Arc<VmObject>> {
        match self.kind {
            VmObjectKind::Anonymous => self.try_clone_anonymous(),
            VmObjectKind::SharedInode(_) | VmObjectKind::PrivateInode(_) => self.try_clone_inode(),
        }
    }

    // ========================================================================
    // Region registry
    // ========================================================================

    pub(crate) fn add_region(&self, id: RegionId, region: Weak<Region>) {
        let mut regions = self.regions.lock();
        debug_assert!(regions.iter().all(|(existing, _)| *existing != id));
        regions.push((id, region));
    }

    pub(crate) fn remove_region(&self, id: RegionId) {
        self.regions.lock().retain(|(existing, _)| *existing != id);
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Call `f` on every live region mapping this object
    pub fn for_each_region<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Region>),
    {
        let regions: Vec<Arc<Region>> = self
            .regions
            .lock()
            .iter()
            .filter_map(|(_, region)| region.upgrade())
            .collect();
        for region in &regions {
            f(region);
        }
    }

    /// Reinstall slot `page_index` in every region mapping it
    ///
    /// Returns false if any region could not install its entry.
    pub(crate) fn remap_page(&self, state: &VmObjectState, page_index: usize) -> bool {
        let mut success = true;
        self.for_each_region(|region| {
            if !region.remap_vmobject_page(state, page_index, ShouldFlushTlb::Yes) {
                success = false;
            }
        });
        success
    }

    /// Reinstall `count` slots starting at `base` in every region mapping them
    pub(crate) fn remap_page_range(&self, state: &VmObjectState, base: usize, count: usize) -> bool {
        let mut success = true;
        self.for_each_region(|region| {
            if !region.remap_vmobject_page_range(state, base, count) {
                success = false;
            }
        });
        success
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(anonymous) = state.anonymous.as_ref() {
            if anonymous.unused_committed_pages > 0 {
                self.allocator
                    .uncommit_user_physical_pages(anonymous.unused_committed_pages);
            }
        }
    }
}
