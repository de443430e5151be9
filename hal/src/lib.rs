//! # Kestrel HAL - Hardware Abstraction Layer
//!
//! This crate defines the architecture-neutral view of the machine that the
//! process and trap subsystems work against:
//!
//! - **Addresses**: virtual addresses and the user/kernel split
//! - **Traps**: the trap frame pushed by the exception entry stubs, trap
//!   kinds and their printable names
//! - **CPUs**: per-CPU scheduling/atomicity state and optional protection
//!   features (NX, SMEP, SMAP)
//! - **Clock**: a monotonic tick source used for rate limiting and
//!   accounting
//!
//! Architecture ports fill a [`trap::TrapFrame`] from their own register
//! layout before calling into the kernel; nothing above this crate looks at
//! raw hardware registers.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

pub mod clock;
pub mod cpu;
pub mod trap;

pub use clock::{Clock, TickClock};
pub use cpu::{CpuFeatures, CpuId, CpuLocal, CpuSet};
pub use trap::{FaultCause, Privilege, TrapFlags, TrapFrame, TrapKind};

/// Size of a base page in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Highest user virtual address (exclusive)
pub const USER_END: u64 = 0x0000_7fff_ffff_f000;

/// Lowest kernel virtual address
pub const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

/// Virtual address type (architecture-independent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Align the address up to the given alignment
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Round down to the containing page
    #[inline]
    pub const fn page(self) -> Self {
        self.align_down(PAGE_SIZE)
    }

    /// Add an offset, saturating at the top of the address space
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    /// Does this address belong to the kernel half?
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_BASE
    }

    /// Does this address belong to the user half?
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < USER_END
    }
}

impl core::fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for VirtAddr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

static_assertions::const_assert!(PAGE_SIZE.is_power_of_two());
static_assertions::const_assert!(USER_END < KERNEL_BASE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let va = VirtAddr::new(0x1234_5678);
        assert_eq!(va.page().as_u64(), 0x1234_5000);
        assert_eq!(va.align_up(PAGE_SIZE).as_u64(), 0x1234_6000);
        assert!(va.page().is_aligned(PAGE_SIZE));
    }

    #[test]
    fn test_address_halves() {
        assert!(VirtAddr::new(0x1000).is_user());
        assert!(!VirtAddr::new(0x1000).is_kernel());
        assert!(VirtAddr::new(KERNEL_BASE + 0x10).is_kernel());
        assert!(!VirtAddr::new(USER_END).is_user());
    }
}
