//! # Kestrel Memory Subsystem
//!
//! The memory subsystem provides what process creation and fault handling
//! need from virtual memory:
//! - A physical frame pool (kernel stacks and resident pages draw from it)
//! - Memory protection and access kinds
//! - Virtual memory regions (anonymous, stack, file-backed)
//! - Address spaces with fault resolution, copy-on-write fork and stack
//!   growth accounting
//!
//! ## Key Principle
//!
//! Address spaces are shared through `Arc` handles. Sharing an address space
//! is cloning the handle; forking one is [`AddressSpace::duplicate_for_fork`].

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

pub mod physical;
pub mod protection;
pub mod region;
pub mod virtual_memory;

pub use physical::{FrameLease, FramePool};
pub use protection::{AccessType, ProtectionFlags};
pub use region::{RegionKind, VmRegion};
pub use virtual_memory::address_space::{AddressSpace, SpaceKind, STACK_GUARD_TOLERANCE};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Out of memory (no free frames)
    OutOfMemory,
    /// Invalid address
    InvalidAddress,
    /// Invalid size
    InvalidSize,
    /// Region already mapped
    AlreadyMapped,
    /// Region not mapped
    NotMapped,
    /// Permission denied
    PermissionDenied,
    /// Backing store I/O failed
    Io,
    /// The access needs a page fault to be resolved first
    WouldFault,
}

impl core::fmt::Display for MemError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            MemError::OutOfMemory => "out of memory",
            MemError::InvalidAddress => "invalid address",
            MemError::InvalidSize => "invalid size",
            MemError::AlreadyMapped => "already mapped",
            MemError::NotMapped => "not mapped",
            MemError::PermissionDenied => "permission denied",
            MemError::Io => "I/O error",
            MemError::WouldFault => "page not resident",
        };
        f.write_str(s)
    }
}
