//! Error types for the VM core using thiserror

use thiserror::Error;

use crate::types::{PhysicalAddress, VirtualAddress};

/// Recoverable VM failures
///
/// Resource exhaustion always surfaces here and is never a panic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("unable to commit {pages} physical pages")]
    CommitFailed { pages: usize },

    #[error("invalid virtual range")]
    InvalidRange,

    #[error("physical range at {base} of {size} bytes wraps around")]
    AddressWrap { base: PhysicalAddress, size: u64 },

    #[error("no page table available for {0}")]
    PageTableExhausted(VirtualAddress),
}

/// Backing store read failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeError {
    #[error("I/O error reading inode (code {0})")]
    Io(i32),

    #[error("read at offset {offset} is past the end of the inode")]
    OutOfBounds { offset: u64 },
}

/// Side of a quickmap copy that faulted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFault {
    #[error("failed to read from source page")]
    Source,

    #[error("failed to write to destination page")]
    Destination,
}

/// Quickmap failures reported by the frame allocator
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickmapError {
    #[error("frame at {0} has no mappable contents")]
    NoContents(PhysicalAddress),
}

pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(VmError::InvalidRange.to_string(), "invalid virtual range");
        assert_eq!(
            VmError::CommitFailed { pages: 3 }.to_string(),
            "unable to commit 3 physical pages"
        );
        assert_eq!(CopyFault::Source.to_string(), "failed to read from source page");
    }
}
