//! VM Page - Physical Frame Handles
//!
//! A [`PhysicalPage`] is a strong, reference-counted handle to one physical
//! frame. VM objects hold one handle per page slot; regions never hold their
//! own, they read through the object. Two frames are special and shared by
//! everyone:
//!
//! - the **shared zero frame**, backing pages that were never written
//! - the **lazy-commit sentinel**, backing pages reserved against the global
//!   commit budget but not yet allocated
//!
//! Frame contents live with the frame so that the hosted allocator can hand
//! out real bytes through its quickmap window. Sentinel frames have none.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::fmt;
use spin::Mutex;

use crate::types::PhysicalAddress;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Contents of one frame
pub type PageBuffer = [u8; PAGE_SIZE];

// ============================================================================
// Frame kinds
// ============================================================================

/// What a frame handle stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// A real, privately allocatable frame
    Normal,
    /// The globally shared all-zero frame
    SharedZero,
    /// The globally shared lazy-commit sentinel
    LazyCommitted,
}

/// Whether dropping the last handle gives the frame back to its allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MayReturnToFreeList {
    Yes,
    No,
}

/// Receiver for frames whose last handle went away
pub trait FreeList: Send + Sync {
    fn return_frame(&self, paddr: PhysicalAddress);
}

// ============================================================================
// Physical frame
// ============================================================================

struct PhysicalFrame {
    paddr: PhysicalAddress,
    kind: PageKind,
    contents: Option<Mutex<Box<PageBuffer>>>,
    owner: Option<Weak<dyn FreeList>>,
}

impl Drop for PhysicalFrame {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take().and_then(|weak| weak.upgrade()) {
            owner.return_frame(self.paddr);
        }
    }
}

/// Strong handle to a physical frame
#[derive(Clone)]
pub struct PhysicalPage(Arc<PhysicalFrame>);

impl PhysicalPage {
    /// Create a frame for a fixed physical address
    ///
    /// Such frames are never returned to any free list.
    pub fn create(paddr: PhysicalAddress) -> Self {
        Self(Arc::new(PhysicalFrame {
            paddr,
            kind: PageKind::Normal,
            contents: Some(Mutex::new(Box::new([0; PAGE_SIZE]))),
            owner: None,
        }))
    }

    /// Create a frame that goes back to `owner` once the last handle drops
    pub fn create_owned(paddr: PhysicalAddress, owner: Weak<dyn FreeList>) -> Self {
        Self(Arc::new(PhysicalFrame {
            paddr,
            kind: PageKind::Normal,
            contents: Some(Mutex::new(Box::new([0; PAGE_SIZE]))),
            owner: Some(owner),
        }))
    }

    /// Create one of the shared sentinel frames
    pub fn create_sentinel(paddr: PhysicalAddress, kind: PageKind) -> Self {
        debug_assert_ne!(kind, PageKind::Normal);
        Self(Arc::new(PhysicalFrame {
            paddr,
            kind,
            contents: None,
            owner: None,
        }))
    }

    pub fn paddr(&self) -> PhysicalAddress {
        self.0.paddr
    }

    pub fn kind(&self) -> PageKind {
        self.0.kind
    }

    pub fn is_shared_zero_page(&self) -> bool {
        self.0.kind == PageKind::SharedZero
    }

    pub fn is_lazy_committed_page(&self) -> bool {
        self.0.kind == PageKind::LazyCommitted
    }

    /// Either of the two shared sentinels
    pub fn is_sentinel(&self) -> bool {
        self.0.kind != PageKind::Normal
    }

    pub fn may_return_to_free_list(&self) -> MayReturnToFreeList {
        if self.0.owner.is_some() {
            MayReturnToFreeList::Yes
        } else {
            MayReturnToFreeList::No
        }
    }

    /// Number of strong handles to this frame
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether both handles name the same frame
    pub fn ptr_eq(&self, other: &PhysicalPage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn contents(&self) -> Option<&Mutex<Box<PageBuffer>>> {
        self.0.contents.as_ref()
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("paddr", &self.0.paddr)
            .field("kind", &self.0.kind)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.paddr)
    }
}

// ============================================================================
// Page arithmetic
// ============================================================================

/// Number of pages needed to hold `size` bytes
pub const fn page_count_for(size: u64) -> usize {
    ((size + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64) as usize
}
