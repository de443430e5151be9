//! # Page Fault Resolution
//!
//! User and kernel faults share one resolution step: round to the page,
//! derive the access from the cause bits, fault the page in (retrying a
//! denied read as an execute when the CPU has no NX bit) and grow the stack
//! on success. They differ in what happens around it.
//!
//! - A user fault that cannot be resolved becomes a signal.
//! - A kernel fault is checked against the recovery table and the
//!   supervisor protection features first; if it still cannot be resolved
//!   it either resumes at the armed recovery point or is fatal.

use crate::recovery::{RecoveryPoint, RecoveryTable};
use alloc::sync::Arc;
use core::fmt;
use kestrel_execution::signal::{code, Signal};
use kestrel_execution::Thread;
use kestrel_hal::{CpuFeatures, CpuLocal, FaultCause, TrapFrame, VirtAddr};
use kestrel_memory::{AccessType, AddressSpace, MemError, MemResult};

/// Result of a user-mode fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFault {
    /// The page is there now; resume
    Handled,
    /// Deliver a signal
    Signal {
        /// Signal number
        signo: Signal,
        /// Reason code
        code: i32,
    },
}

/// Result of a kernel-mode fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFault {
    /// The page is there now; resume at the faulting instruction
    Resolved,
    /// The frame now resumes at the recovery point
    Recovered(RecoveryPoint),
    /// Fatal
    Unhandled(UnhandledFault),
}

impl KernelFault {
    /// Will the interrupted context resume?
    pub fn is_handled(self) -> bool {
        !matches!(self, KernelFault::Unhandled(_))
    }
}

/// Why a kernel fault could not be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledFault {
    /// No thread or process to resolve against
    NoContext,
    /// The armed recovery address is not in the table
    InvalidRecoveryPoint(u64),
    /// Instruction fetch from a user page
    SupervisorExecute(u64),
    /// Implicit access to a user page
    SupervisorAccess(u64),
    /// Resolution failed and nothing was armed
    Unresolved {
        /// Faulting address
        addr: u64,
        /// Access attempted
        access: AccessType,
        /// Why resolution failed
        error: MemError,
    },
}

impl fmt::Display for UnhandledFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            UnhandledFault::NoContext => f.write_str("kernel fault with no thread context"),
            UnhandledFault::InvalidRecoveryPoint(addr) => {
                write!(f, "invalid recovery point {:#x}", addr)
            }
            UnhandledFault::SupervisorExecute(addr) => write!(
                f,
                "attempt to execute user address {:#x} (supervisor mode execution prevention)",
                addr
            ),
            UnhandledFault::SupervisorAccess(addr) => write!(
                f,
                "attempt to access user address {:#x} (supervisor mode access prevention)",
                addr
            ),
            UnhandledFault::Unresolved { addr, access, error } => {
                write!(f, "fault({:#x}, {:?}) -> {}", addr, access, error)
            }
        }
    }
}

/// Page fault resolver
#[derive(Debug)]
pub struct FaultResolver {
    kernel_space: Arc<AddressSpace>,
    recovery: Arc<RecoveryTable>,
    features: CpuFeatures,
}

impl FaultResolver {
    /// Create a resolver for the given kernel map and CPU features
    pub fn new(kernel_space: Arc<AddressSpace>, recovery: Arc<RecoveryTable>, features: CpuFeatures) -> Self {
        Self {
            kernel_space,
            recovery,
            features,
        }
    }

    /// Recovery table
    pub fn recovery(&self) -> &Arc<RecoveryTable> {
        &self.recovery
    }

    /// Access a fault asked for
    pub fn access_for(cause: FaultCause) -> AccessType {
        if cause.contains(FaultCause::WRITE) {
            AccessType::Write
        } else if cause.contains(FaultCause::INSTRUCTION_FETCH) {
            AccessType::Execute
        } else {
            AccessType::Read
        }
    }

    fn attempt(&self, vm: &AddressSpace, addr: VirtAddr, access: AccessType) -> MemResult<()> {
        let page = addr.page();
        match vm.resolve_fault(page, access) {
            // Without NX, execute permission is indistinguishable from read.
            Err(MemError::PermissionDenied) if access == AccessType::Read && !self.features.has_nx => {
                vm.resolve_fault(page, AccessType::Execute)
            }
            other => other,
        }
    }

    /// Resolve a fault taken in user mode
    pub fn resolve_user_fault(&self, thread: &Arc<Thread>, addr: VirtAddr, access: AccessType) -> UserFault {
        let Some(process) = thread.process() else {
            return UserFault::Signal {
                signo: Signal::SIGSEGV,
                code: code::SEGV_MAPERR,
            };
        };
        let vm = process.vm();
        let error = match self.attempt(&vm, addr, access) {
            Ok(()) => {
                vm.grow(addr);
                return UserFault::Handled;
            }
            Err(error) => error,
        };

        let (signo, code) = match error {
            MemError::OutOfMemory => {
                log::error!(
                    "out of swap: pid {} ({}), uid {} killed",
                    process.pid(),
                    process.name(),
                    process.cred().ruid
                );
                (Signal::SIGKILL, code::SI_NOINFO)
            }
            MemError::PermissionDenied => (Signal::SIGSEGV, code::SEGV_ACCERR),
            MemError::Io => (Signal::SIGBUS, code::BUS_OBJERR),
            _ => (Signal::SIGSEGV, code::SEGV_MAPERR),
        };
        UserFault::Signal { signo, code }
    }

    /// Resolve a fault taken in kernel mode
    ///
    /// On `Recovered` the frame's program counter has been moved to the
    /// recovery point.
    pub fn resolve_kernel_fault(
        &self,
        current: Option<&Arc<Thread>>,
        cpu: &CpuLocal,
        frame: &mut TrapFrame,
    ) -> KernelFault {
        let Some(thread) = current else {
            return KernelFault::Unhandled(UnhandledFault::NoContext);
        };
        let Some(process) = thread.process() else {
            return KernelFault::Unhandled(UnhandledFault::NoContext);
        };

        let addr = VirtAddr::new(frame.addr);
        let cause = frame.fault_cause();
        let access = Self::access_for(cause);

        let armed = thread.onfault();
        let onfault = if armed == 0 {
            None
        } else {
            match self.recovery.validate(armed) {
                Some(point) => Some(point),
                None => return KernelFault::Unhandled(UnhandledFault::InvalidRecoveryPoint(armed)),
            }
        };

        if onfault.is_none() && addr.is_user() {
            if self.features.has_smep && cause.contains(FaultCause::INSTRUCTION_FETCH) {
                return KernelFault::Unhandled(UnhandledFault::SupervisorExecute(frame.addr));
            }
            if self.features.has_smap && cause.contains(FaultCause::PRESENT) {
                return KernelFault::Unhandled(UnhandledFault::SupervisorAccess(frame.addr));
            }
        }

        let in_kernel_map = addr.is_kernel();
        let vm = if in_kernel_map {
            Arc::clone(&self.kernel_space)
        } else {
            process.vm()
        };

        let result = if cpu.in_atomic() && !in_kernel_map {
            Err(MemError::PermissionDenied)
        } else {
            thread.set_onfault(0);
            let result = self.attempt(&vm, addr, access);
            thread.set_onfault(armed);
            if result.is_ok() && !in_kernel_map {
                vm.grow(addr);
            }
            result
        };

        match (result, onfault) {
            (Ok(()), _) => KernelFault::Resolved,
            (Err(_), Some(point)) => {
                frame.pc = self.recovery.address(point);
                KernelFault::Recovered(point)
            }
            (Err(error), None) => KernelFault::Unhandled(UnhandledFault::Unresolved {
                addr: frame.addr,
                access,
                error,
            }),
        }
    }
}
