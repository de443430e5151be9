//! # CPU State
//!
//! Per-CPU flags consulted on trap entry and exit, plus the optional
//! protection features that change how kernel page faults are judged.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Logical CPU identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub u32);

impl CpuId {
    /// The bootstrap processor
    pub const BOOT: CpuId = CpuId(0);

    /// Index into per-CPU tables
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Optional protection features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuFeatures {
    /// No-execute page protection
    pub has_nx: bool,
    /// Supervisor mode execution prevention
    pub has_smep: bool,
    /// Supervisor mode access prevention
    pub has_smap: bool,
}

impl CpuFeatures {
    /// Every protection feature enabled
    pub const fn full() -> Self {
        Self {
            has_nx: true,
            has_smep: true,
            has_smap: true,
        }
    }

    /// No protection features (legacy CPUs)
    pub const fn legacy() -> Self {
        Self {
            has_nx: false,
            has_smep: false,
            has_smap: false,
        }
    }
}

/// Per-CPU state
#[derive(Debug)]
pub struct CpuLocal {
    id: CpuId,
    /// Set when a higher priority thread became runnable
    want_resched: AtomicBool,
    /// Nesting depth of atomic (non-sleeping) sections
    atomic_depth: AtomicU32,
}

impl CpuLocal {
    /// Create state for one CPU
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            want_resched: AtomicBool::new(false),
            atomic_depth: AtomicU32::new(0),
        }
    }

    /// This CPU's id
    #[inline]
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Ask for a reschedule at the next user return
    pub fn request_resched(&self) {
        self.want_resched.store(true, Ordering::Release);
    }

    /// Is a reschedule pending?
    pub fn resched_pending(&self) -> bool {
        self.want_resched.load(Ordering::Acquire)
    }

    /// Consume a pending reschedule request
    pub fn take_resched(&self) -> bool {
        self.want_resched.swap(false, Ordering::AcqRel)
    }

    /// Enter a section that must not sleep
    pub fn enter_atomic(&self) {
        self.atomic_depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave a section entered with [`enter_atomic`](Self::enter_atomic)
    pub fn exit_atomic(&self) {
        let prev = self.atomic_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced exit_atomic");
    }

    /// Is this CPU inside an atomic section?
    pub fn in_atomic(&self) -> bool {
        self.atomic_depth.load(Ordering::Acquire) > 0
    }
}

/// The set of CPUs in the system
#[derive(Debug)]
pub struct CpuSet {
    cpus: Vec<CpuLocal>,
    features: CpuFeatures,
}

impl CpuSet {
    /// Create `count` CPUs sharing the same feature set
    pub fn new(count: u32, features: CpuFeatures) -> Self {
        let count = count.max(1);
        Self {
            cpus: (0..count).map(|i| CpuLocal::new(CpuId(i))).collect(),
            features,
        }
    }

    /// Uniprocessor with the given features
    pub fn uniprocessor(features: CpuFeatures) -> Self {
        Self::new(1, features)
    }

    /// Number of CPUs
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// A set always has at least the boot CPU
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Look up a CPU; out-of-range ids fall back to the boot CPU
    pub fn get(&self, id: CpuId) -> &CpuLocal {
        self.cpus.get(id.index()).unwrap_or(&self.cpus[0])
    }

    /// The boot CPU
    pub fn boot(&self) -> &CpuLocal {
        &self.cpus[0]
    }

    /// Protection features
    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    /// Iterate over all CPUs
    pub fn iter(&self) -> impl Iterator<Item = &CpuLocal> {
        self.cpus.iter()
    }
}
