//! Resident Page Allocation
//!
//! The physical frame allocator is a collaborator of the VM core: it hands
//! out frames, keeps the global commit budget, owns the two shared sentinel
//! frames and provides the quickmap window used to copy frame contents.
//!
//! [`FrameAllocator`] is the seam; [`FramePool`] is a hosted implementation
//! over a fixed number of frames, modelled on a free-queue page manager.
//!
//! ## Commit accounting
//!
//! A commit reserves free frames without allocating them. Uncommitted
//! allocations may only use free frames nobody reserved, so a committed
//! allocation can never fail.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::config::COMMIT_DEBUG;
use crate::error::QuickmapError;
use crate::types::PhysicalAddress;
use crate::vm::vm_page::{FreeList, PageBuffer, PageKind, PhysicalPage, PAGE_SIZE};

/// Whether a newly allocated frame must be cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldZeroFill {
    Yes,
    No,
}

// ============================================================================
// Quickmap
// ============================================================================

/// A frame temporarily mapped into kernel space
///
/// Unmapped when dropped.
pub struct QuickMap<'a> {
    page: &'a PhysicalPage,
    bytes: MutexGuard<'a, Box<PageBuffer>>,
}

impl<'a> QuickMap<'a> {
    pub fn paddr(&self) -> PhysicalAddress {
        self.page.paddr()
    }
}

impl Deref for QuickMap<'_> {
    type Target = PageBuffer;

    fn deref(&self) -> &PageBuffer {
        &self.bytes
    }
}

impl DerefMut for QuickMap<'_> {
    fn deref_mut(&mut self) -> &mut PageBuffer {
        &mut self.bytes
    }
}

// ============================================================================
// Allocator interface
// ============================================================================

/// Physical frame allocator and global commit accounting
pub trait FrameAllocator: Send + Sync {
    /// Allocate a frame from the uncommitted pool, `None` when exhausted
    fn allocate_user_physical_page(&self, zero_fill: ShouldZeroFill) -> Option<PhysicalPage>;

    /// Allocate a frame against a previous commit
    ///
    /// Calling this without an outstanding commit is a logic error.
    fn allocate_committed_user_physical_page(&self, zero_fill: ShouldZeroFill) -> PhysicalPage;

    /// Reserve `count` frames, all or nothing
    fn commit_user_physical_pages(&self, count: usize) -> bool;

    /// Release `count` previously reserved frames
    fn uncommit_user_physical_pages(&self, count: usize);

    fn shared_zero_page(&self) -> PhysicalPage;

    fn lazy_committed_page(&self) -> PhysicalPage;

    /// Map `page` into the quickmap window
    fn quickmap_page<'a>(&'a self, page: &'a PhysicalPage) -> Result<QuickMap<'a>, QuickmapError> {
        match page.contents() {
            Some(contents) => Ok(QuickMap {
                page,
                bytes: contents.lock(),
            }),
            None => Err(QuickmapError::NoContents(page.paddr())),
        }
    }
}

// ============================================================================
// Hosted frame pool
// ============================================================================

/// First physical address handed out by a [`FramePool`]
pub const FRAME_POOL_BASE: u64 = 0x0010_0000;

/// Snapshot of pool accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePoolStats {
    pub total: usize,
    pub free: usize,
    pub committed: usize,
    pub allocated: usize,
}

impl FramePoolStats {
    /// Free frames nobody has reserved
    pub fn uncommitted(&self) -> usize {
        self.free - self.committed
    }
}

struct PoolState {
    free: Vec<PhysicalAddress>,
    committed: usize,
    allocated: usize,
}

struct FramePoolInner {
    total: usize,
    state: Mutex<PoolState>,
}

impl FreeList for FramePoolInner {
    fn return_frame(&self, paddr: PhysicalAddress) {
        let mut state = self.state.lock();
        state.free.push(paddr);
        state.allocated -= 1;
    }
}

/// Fixed-size frame allocator for hosted use
pub struct FramePool {
    inner: Arc<FramePoolInner>,
    shared_zero: PhysicalPage,
    lazy_committed: PhysicalPage,
}

impl FramePool {
    /// Create a pool of `total_frames` frames
    pub fn new(total_frames: usize) -> Self {
        // Popped from the back, so the lowest address goes out first
        let free = (0..total_frames)
            .rev()
            .map(|i| PhysicalAddress::new(FRAME_POOL_BASE + (i * PAGE_SIZE) as u64))
            .collect();

        Self {
            inner: Arc::new(FramePoolInner {
                total: total_frames,
                state: Mutex::new(PoolState {
                    free,
                    committed: 0,
                    allocated: 0,
                }),
            }),
            shared_zero: PhysicalPage::create_sentinel(
                PhysicalAddress::new(FRAME_POOL_BASE - 2 * PAGE_SIZE as u64),
                PageKind::SharedZero,
            ),
            lazy_committed: PhysicalPage::create_sentinel(
                PhysicalAddress::new(FRAME_POOL_BASE - PAGE_SIZE as u64),
                PageKind::LazyCommitted,
            ),
        }
    }

    pub fn stats(&self) -> FramePoolStats {
        let state = self.inner.state.lock();
        FramePoolStats {
            total: self.inner.total,
            free: state.free.len(),
            committed: state.committed,
            allocated: state.allocated,
        }
    }

    fn take_frame(&self, state: &mut PoolState) -> Option<PhysicalPage> {
        let paddr = state.free.pop()?;
        state.allocated += 1;
        let owner: Weak<dyn FreeList> = Arc::downgrade(&self.inner) as Weak<dyn FreeList>;
        Some(PhysicalPage::create_owned(paddr, owner))
    }
}

impl FrameAllocator for FramePool {
    fn allocate_user_physical_page(&self, _zero_fill: ShouldZeroFill) -> Option<PhysicalPage> {
        // Fresh frames always come up zeroed in the hosted pool
        let mut state = self.inner.state.lock();
        if state.free.len() <= state.committed {
            return None;
        }
        self.take_frame(&mut state)
    }

    fn allocate_committed_user_physical_page(&self, _zero_fill: ShouldZeroFill) -> PhysicalPage {
        let mut state = self.inner.state.lock();
        if state.committed == 0 {
            panic!("FramePool: committed allocation without an outstanding commit");
        }
        state.committed -= 1;
        match self.take_frame(&mut state) {
            Some(page) => page,
            None => panic!("FramePool: committed frame missing from free list"),
        }
    }

    fn commit_user_physical_pages(&self, count: usize) -> bool {
        let mut state = self.inner.state.lock();
        if state.free.len() - state.committed < count {
            if COMMIT_DEBUG {
                log::debug!(
                    "FramePool: cannot commit {} pages, {} uncommitted",
                    count,
                    state.free.len() - state.committed
                );
            }
            return false;
        }
        state.committed += count;
        if COMMIT_DEBUG {
            log::debug!("FramePool: committed {} pages, {} total", count, state.committed);
        }
        true
    }

    fn uncommit_user_physical_pages(&self, count: usize) {
        let mut state = self.inner.state.lock();
        if state.committed < count {
            panic!(
                "FramePool: uncommit of {} pages with only {} committed",
                count, state.committed
            );
        }
        state.committed -= count;
        if COMMIT_DEBUG {
            log::debug!("FramePool: uncommitted {} pages, {} total", count, state.committed);
        }
    }

    fn shared_zero_page(&self) -> PhysicalPage {
        self.shared_zero.clone()
    }

    fn lazy_committed_page(&self) -> PhysicalPage {
        self.lazy_committed.clone()
    }
}
