//! Build-time configuration
//!
//! Debug switches are cargo features; layout constants describe the
//! x86_32-style address space the regions are mapped into.

/// Trace every page fault decision (`page_fault_debug` feature)
pub const PAGE_FAULT_DEBUG: bool = cfg!(feature = "page_fault_debug");

/// Trace commit / uncommit accounting (`commit_debug` feature)
pub const COMMIT_DEBUG: bool = cfg!(feature = "commit_debug");

/// Lowest address a user mapping may occupy
pub const USER_RANGE_BASE: u64 = 0x0080_0000;

/// Start of the kernel half of the address space
pub const KERNEL_BASE: u64 = 0xC000_0000;

/// Entries per page table
pub const PAGE_TABLE_ENTRY_COUNT: usize = 1024;

/// Entries per page directory
pub const PAGE_DIRECTORY_ENTRY_COUNT: usize = 1024;

/// Maximum length of a region name
pub const REGION_NAME_MAX: usize = 64;

/// Whether `addr` lies below the kernel half
pub const fn is_user_address(addr: u64) -> bool {
    addr < KERNEL_BASE
}
