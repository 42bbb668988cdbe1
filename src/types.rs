//! Common types used across the VM core
//!
//! This module defines shared address and identifier types to avoid
//! circular dependencies between the VM modules.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::vm::vm_page::PAGE_SIZE;

/// VM object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Create a new object ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        VmObjectId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Region identifier, doubles as the registration token a VM object holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RegionId(pub u64);

impl RegionId {
    /// Create a new region ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RegionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:#010x}", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:#010x}", self.0)
    }
}

/// Physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Offset by `bytes`, `None` on wrap-around
    pub const fn checked_offset(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{:#010x}", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{:#010x}", self.0)
    }
}

/// A page-aligned range of virtual addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: u64,
}

impl VirtualRange {
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the last address
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress(self.base.0 + self.size)
    }

    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.0 >= self.base.0 && addr.0 < self.base.0 + self.size
    }

    /// Whether `other` lies entirely inside this range
    pub const fn contains_range(&self, other: &VirtualRange) -> bool {
        other.base.0 >= self.base.0 && other.base.0 + other.size <= self.base.0 + self.size
    }

    pub const fn overlaps(&self, other: &VirtualRange) -> bool {
        self.base.0 < other.base.0 + other.size && other.base.0 < self.base.0 + self.size
    }

    pub const fn page_count(&self) -> usize {
        (self.size / PAGE_SIZE as u64) as usize
    }
}
