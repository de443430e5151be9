//! # User Trap Classification
//!
//! Every trap a user thread can legitimately take maps to exactly one
//! signal and reason code. Page faults need the resolver first. Anything
//! else reaching the user path is a kernel bug.

use kestrel_execution::signal::{code, Signal};
use kestrel_hal::TrapKind;

/// What a user-origin trap turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTrapClass {
    /// Deliver this signal
    Signal {
        /// Signal number
        signo: Signal,
        /// Reason code
        code: i32,
    },
    /// Hand to the page fault resolver
    PageFault,
    /// No user trap of this kind should exist
    Impossible,
}

/// Control protection error codes below this are branch target violations
const CP_BTCFI_LIMIT: u64 = 4;

/// Classify a trap taken from user mode
///
/// `err` is the hardware error code; only control protection faults look at
/// it.
pub fn classify_user_trap(kind: Option<TrapKind>, err: u64) -> UserTrapClass {
    let (signo, code) = match kind {
        Some(TrapKind::PageFault) => return UserTrapClass::PageFault,
        Some(TrapKind::InvalidTss) => (Signal::SIGBUS, code::BUS_OBJERR),
        Some(TrapKind::Protection | TrapKind::SegmentNotPresent | TrapKind::StackFault) => {
            (Signal::SIGSEGV, code::SEGV_MAPERR)
        }
        Some(TrapKind::ControlProtection) => {
            let code = if err & 0x7fff < CP_BTCFI_LIMIT {
                code::ILL_BTCFI
            } else {
                code::ILL_BADSTK
            };
            (Signal::SIGILL, code)
        }
        Some(TrapKind::Alignment) => (Signal::SIGBUS, code::BUS_ADRALN),
        Some(TrapKind::PrivilegedInstruction) => (Signal::SIGILL, code::ILL_PRVOPC),
        Some(TrapKind::Divide) => (Signal::SIGFPE, code::FPE_INTDIV),
        Some(TrapKind::Arithmetic | TrapKind::Simd) => (Signal::SIGFPE, code::FPE_FLTINV),
        Some(TrapKind::Breakpoint | TrapKind::Trace) => (Signal::SIGTRAP, code::TRAP_BRKPT),
        Some(
            TrapKind::Ast
            | TrapKind::Nmi
            | TrapKind::Overflow
            | TrapKind::Bound
            | TrapKind::DeviceNotAvailable
            | TrapKind::DoubleFault
            | TrapKind::FpuOperand
            | TrapKind::MachineCheck
            | TrapKind::Virtualization,
        )
        | None => return UserTrapClass::Impossible,
    };
    UserTrapClass::Signal { signo, code }
}
