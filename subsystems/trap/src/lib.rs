//! # Kestrel Trap Subsystem
//!
//! Everything that turns an entry into the kernel into a well-defined
//! outcome:
//!
//! - **Dispatch**: kernel-origin and user-origin traps take different paths
//!   ([`TrapDispatcher::handle_kernel_trap`], [`TrapDispatcher::handle_user_trap`])
//! - **Page faults**: one resolution algorithm, two policies
//!   ([`fault::FaultResolver`])
//! - **Recovery points**: registered resume addresses for code that expects
//!   to fault ([`recovery::RecoveryTable`])
//! - **Syscalls**: number decoding, argument marshalling and the result
//!   convention ([`TrapDispatcher::handle_syscall`])
//! - **AST**: deferred work before returning to user mode
//!
//! ## Outcomes
//!
//! A user trap ends in a signal or a silent resume. A kernel trap is either
//! resolved or fatal; fatal paths go through the [`hooks::Diagnostics`]
//! collaborator and never return.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

pub mod classify;
pub mod dispatch;
pub mod fault;
pub mod hooks;
pub mod recovery;
pub mod syscall;
pub mod sysent;
pub mod uaccess;

mod trap_tests;

pub use dispatch::TrapDispatcher;
pub use fault::{FaultResolver, KernelFault, UserFault};
pub use hooks::{Debugger, Diagnostics, NmiRecovery, TrapHooks};
pub use recovery::{RecoveryPoint, RecoveryTable};
pub use syscall::{SysError, SysResult};

use core::sync::atomic::{AtomicU64, Ordering};

/// Trap counters
#[derive(Debug, Default)]
pub struct TrapStats {
    traps: AtomicU64,
    syscalls: AtomicU64,
    softs: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy of [`TrapStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapStatsSnapshot {
    /// Traps taken, either origin
    pub traps: u64,
    /// System calls
    pub syscalls: u64,
    /// AST entries
    pub softs: u64,
    /// Page faults
    pub faults: u64,
}

impl TrapStats {
    /// Zeroed counters
    pub const fn new() -> Self {
        Self {
            traps: AtomicU64::new(0),
            syscalls: AtomicU64::new(0),
            softs: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_trap(&self) {
        self.traps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_syscall(&self) {
        self.syscalls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_soft(&self) {
        self.softs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> TrapStatsSnapshot {
        TrapStatsSnapshot {
            traps: self.traps.load(Ordering::Relaxed),
            syscalls: self.syscalls.load(Ordering::Relaxed),
            softs: self.softs.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}
