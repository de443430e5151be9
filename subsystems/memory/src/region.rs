//! # Virtual Memory Regions

use crate::protection::ProtectionFlags;
use kestrel_hal::{VirtAddr, PAGE_SIZE};

/// Virtual memory region types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Anonymous memory (heap, data)
    Anonymous,
    /// Stack; grows down from `end()`
    Stack,
    /// File-backed memory
    File {
        /// Reads from the backing object fail
        io_error: bool,
    },
    /// Kernel memory
    Kernel,
}

/// Virtual memory region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRegion {
    /// Start address
    pub start: VirtAddr,
    /// Size in bytes
    pub size: u64,
    /// Protection
    pub protection: ProtectionFlags,
    /// Region type
    pub kind: RegionKind,
}

impl VmRegion {
    /// Create a region; the size is rounded up to whole pages
    pub fn new(start: VirtAddr, size: u64, protection: ProtectionFlags, kind: RegionKind) -> Self {
        Self {
            start: start.page(),
            size: VirtAddr::new(size).align_up(PAGE_SIZE).as_u64(),
            protection,
            kind,
        }
    }

    /// Get end address
    pub fn end(&self) -> VirtAddr {
        self.start.offset(self.size)
    }

    /// Check if contains address
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Check if overlaps with another region
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Number of pages
    pub fn pages(&self) -> u64 {
        self.size / PAGE_SIZE
    }

    /// Is this a stack region?
    pub fn is_stack(&self) -> bool {
        self.kind == RegionKind::Stack
    }
}
