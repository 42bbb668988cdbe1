//! vmcore - Virtual memory core of a monolithic kernel
//!
//! This crate implements the machine-independent VM layer: reference
//! counted VM objects (anonymous and inode-backed), the regions that map
//! windows of them into address spaces, and page fault resolution with
//! lazy commit, copy-on-write cloning and purgeable memory.
//!
//! The physical frame allocator, the page directory and the backing store
//! are collaborators reached through traits and small hosted
//! implementations, so the core also runs under the test harness.

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]
// Region constructors mirror the kernel's argument lists
#![allow(clippy::too_many_arguments)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Virtual memory
pub mod vm;

pub use error::{CopyFault, InodeError, QuickmapError, VmError, VmResult};
pub use types::{PhysicalAddress, RegionId, VirtualAddress, VirtualRange, VmObjectId};
