//! # Recovery Points
//!
//! Code that touches memory that may legitimately fault (user copies,
//! probing reads) arms a recovery address on the current thread first. When
//! the fault cannot be resolved, the kernel resumes at that address instead
//! of dying.
//!
//! A thread's armed address is only trusted after it is found in this
//! table. Anything else means the thread state is corrupt, and the fault is
//! fatal.

use alloc::vec::Vec;
use spin::RwLock;

/// Resume address of the user-copy routines
pub const COPY_FAULT: u64 = 0xffff_ffff_8010_0000;

/// Resume address of the fault-tolerant kernel read
pub const PROBE_FAULT: u64 = 0xffff_ffff_8010_0040;

/// A validated entry in the recovery table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecoveryPoint(usize);

#[derive(Debug, Clone, Copy)]
struct Entry {
    addr: u64,
    name: &'static str,
}

/// Registered recovery addresses
///
/// Filled at startup, read on every kernel fault that has an armed
/// recovery address.
#[derive(Debug, Default)]
pub struct RecoveryTable {
    entries: RwLock<Vec<Entry>>,
}

impl RecoveryTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding the kernel's own recovery points
    pub fn with_defaults() -> Self {
        let table = Self::new();
        table.register(COPY_FAULT, "copy_fault");
        table.register(PROBE_FAULT, "probe_fault");
        table
    }

    /// Register a recovery address; registering it twice returns the
    /// existing point
    pub fn register(&self, addr: u64, name: &'static str) -> RecoveryPoint {
        let mut entries = self.entries.write();
        if let Some(index) = entries.iter().position(|e| e.addr == addr) {
            return RecoveryPoint(index);
        }
        entries.push(Entry { addr, name });
        RecoveryPoint(entries.len() - 1)
    }

    /// Look up an armed address
    pub fn validate(&self, addr: u64) -> Option<RecoveryPoint> {
        self.entries
            .read()
            .iter()
            .position(|e| e.addr == addr)
            .map(RecoveryPoint)
    }

    /// Resume address of a point
    pub fn address(&self, point: RecoveryPoint) -> u64 {
        self.entries.read()[point.0].addr
    }

    /// Name of a point
    pub fn name(&self, point: RecoveryPoint) -> &'static str {
        self.entries.read()[point.0].name
    }

    /// Number of registered points
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
