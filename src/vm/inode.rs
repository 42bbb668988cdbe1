//! Inode-backed VM Objects
//!
//! Inode objects start with every slot empty and fill them from the
//! backing file on demand. Shared inode objects are mapped into every
//! address space that maps the file; private ones give each mapping its own
//! page slots over the same file.

use alloc::sync::Arc;
use alloc::vec;

use crate::error::{InodeError, VmResult};
use crate::vm::memory_manager::MemoryManager;
use crate::vm::vm_object::{VmObject, VmObjectKind, VmObjectState};
use crate::vm::vm_page::page_count_for;

/// Backing store of an inode VM object
pub trait Inode: Send + Sync {
    /// Read up to `buffer.len()` bytes at `offset`
    ///
    /// Returns the number of bytes read, short at end of file.
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, InodeError>;

    /// Size of the file in bytes
    fn size(&self) -> u64;
}

impl VmObject {
    /// Create an object shared by every mapping of `inode`
    pub fn create_shared_inode(mm: &MemoryManager, inode: Arc<dyn Inode>) -> Arc<VmObject> {
        Self::create_inode(mm, VmObjectKind::SharedInode(inode))
    }

    /// Create an object private to one mapping of `inode`
    pub fn create_private_inode(mm: &MemoryManager, inode: Arc<dyn Inode>) -> Arc<VmObject> {
        Self::create_inode(mm, VmObjectKind::PrivateInode(inode))
    }

    fn create_inode(mm: &MemoryManager, kind: VmObjectKind) -> Arc<VmObject> {
        let page_count = match &kind {
            VmObjectKind::SharedInode(inode) | VmObjectKind::PrivateInode(inode) => page_count_for(inode.size()),
            VmObjectKind::Anonymous => 0,
        };
        let state = VmObjectState::new(vec![None; page_count], None);
        Arc::new(VmObject::new(mm.allocator(), kind, state))
    }

    /// Copy of an inode object sharing every populated frame
    pub(crate) fn try_clone_inode(&self) -> VmResult<Arc<VmObject>> {
        let state = self.lock();
        let clone = VmObjectState::new(state.physical_pages.clone(), None);
        Ok(Arc::new(VmObject::new(self.allocator(), self.kind().clone(), clone)))
    }

    /// Number of populated slots
    pub fn amount_cached(&self) -> usize {
        self.lock().physical_pages.iter().filter(|slot| slot.is_some()).count()
    }
}
