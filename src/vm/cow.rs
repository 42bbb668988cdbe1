//! Copy-on-Write Bookkeeping
//!
//! [`CowMap`] is the per-object bitmap recording which pages still need to
//! be copied before they may be written. [`CommittedCowPages`] is the pool
//! of frames reserved at clone time so that the copies a clone may need can
//! never fail; it is shared by the original and the clone and dissolves
//! once either side sees it empty.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::COMMIT_DEBUG;
use crate::vm::vm_page::PhysicalPage;
use crate::vm::vm_resident::{FrameAllocator, ShouldZeroFill};

// ============================================================================
// COW Bitmap
// ============================================================================

const BITS: usize = u64::BITS as usize;

/// One bit per page, set when the page must be copied before a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CowMap {
    words: Vec<u64>,
    len: usize,
}

impl CowMap {
    /// Create a map of `len` bits, all set to `value`
    pub fn new(len: usize, value: bool) -> Self {
        let mut map = Self {
            words: vec![0; (len + BITS - 1) / BITS],
            len,
        };
        map.fill(value);
        map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "CowMap: index {} out of {}", index, self.len);
        self.words[index / BITS] & (1 << (index % BITS)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "CowMap: index {} out of {}", index, self.len);
        let bit = 1 << (index % BITS);
        if value {
            self.words[index / BITS] |= bit;
        } else {
            self.words[index / BITS] &= !bit;
        }
    }

    pub fn fill(&mut self, value: bool) {
        let word = if value { u64::MAX } else { 0 };
        self.words.iter_mut().for_each(|w| *w = word);
        // Keep the bits past `len` clear so count_set stays exact
        let tail = self.len % BITS;
        if value && tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last = (1 << tail) - 1;
            }
        }
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

// ============================================================================
// Committed COW Pages
// ============================================================================

/// Frames committed at clone time to back future copy-on-write faults
pub struct CommittedCowPages {
    allocator: Arc<dyn FrameAllocator>,
    committed_pages: Mutex<usize>,
}

impl CommittedCowPages {
    /// Take ownership of `committed_pages` already committed frames
    pub fn new(allocator: Arc<dyn FrameAllocator>, committed_pages: usize) -> Self {
        Self {
            allocator,
            committed_pages: Mutex::new(committed_pages),
        }
    }

    /// Take one frame out of the pool, `None` when it is empty
    pub fn allocate_one(&self) -> Option<PhysicalPage> {
        let mut committed = self.committed_pages.lock();
        if *committed == 0 {
            return None;
        }
        *committed -= 1;
        Some(self.allocator.allocate_committed_user_physical_page(ShouldZeroFill::Yes))
    }

    /// Give one unused reservation back to the global budget
    ///
    /// Returns true when the pool is empty afterwards. The other side of
    /// the clone may have drained it since the caller last looked, in which
    /// case nothing is uncommitted.
    pub fn return_one(&self) -> bool {
        let mut committed = self.committed_pages.lock();
        if *committed == 0 {
            return true;
        }
        *committed -= 1;
        self.allocator.uncommit_user_physical_pages(1);
        *committed == 0
    }

    pub fn remaining(&self) -> usize {
        *self.committed_pages.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl Drop for CommittedCowPages {
    fn drop(&mut self) {
        let remaining = *self.committed_pages.get_mut();
        if remaining > 0 {
            if COMMIT_DEBUG {
                log::debug!("CommittedCowPages: uncommitting {} leftover pages", remaining);
            }
            self.allocator.uncommit_user_physical_pages(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::vm_resident::FramePool;

    #[test]
    fn test_cow_map_bits() {
        let mut map = CowMap::new(70, false);
        assert_eq!(map.count_set(), 0);
        map.set(0, true);
        map.set(69, true);
        assert!(map.get(69));
        assert!(!map.get(68));
        assert_eq!(map.count_set(), 2);
        map.set(0, false);
        assert_eq!(map.count_set(), 1);

        map.fill(true);
        assert_eq!(map.count_set(), 70);
        assert_eq!(map.len(), 70);
    }

    #[test]
    fn test_pool_allocates_reserved_frames() {
        let pool = Arc::new(FramePool::new(4));
        assert!(pool.commit_user_physical_pages(2));
        let cow = CommittedCowPages::new(pool.clone(), 2);

        let page = cow.allocate_one();
        assert!(page.is_some());
        assert_eq!(cow.remaining(), 1);
        assert_eq!(pool.stats().committed, 1);

        assert!(cow.return_one());
        assert!(cow.is_empty());
        assert!(cow.allocate_one().is_none());
        assert_eq!(pool.stats().committed, 0);
    }

    #[test]
    fn test_return_one_on_drained_pool() {
        let pool = Arc::new(FramePool::new(4));
        assert!(pool.commit_user_physical_pages(1));
        let cow = CommittedCowPages::new(pool.clone(), 1);
        assert!(cow.allocate_one().is_some());

        // Drained by the other side: nothing left to give back
        assert!(cow.return_one());
        assert_eq!(cow.remaining(), 0);
        assert_eq!(pool.stats().committed, 0);
    }

    #[test]
    fn test_pool_drop_uncommits_leftovers() {
        let pool = Arc::new(FramePool::new(4));
        assert!(pool.commit_user_physical_pages(3));
        let cow = CommittedCowPages::new(pool.clone(), 3);
        drop(cow);
        assert_eq!(pool.stats().committed, 0);
    }
}
