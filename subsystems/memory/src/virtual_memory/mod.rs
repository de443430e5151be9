//! # Virtual Memory Management
//!
//! Address spaces and their identifiers.

pub mod address_space;

use core::sync::atomic::{AtomicU64, Ordering};

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    /// Kernel address space
    pub const KERNEL: Self = Self(0);

    /// Allocate a fresh ID
    pub fn allocate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}
