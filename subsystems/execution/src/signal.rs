//! # Signals
//!
//! Signal numbers, reason codes, the per-process action table and the
//! delivery interface the trap and fork paths post signals through.

use crate::thread::Thread;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// A signal number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u8);

impl Signal {
    /// Illegal instruction
    pub const SIGILL: Signal = Signal(4);
    /// Trace/breakpoint trap
    pub const SIGTRAP: Signal = Signal(5);
    /// Floating point exception
    pub const SIGFPE: Signal = Signal(8);
    /// Kill (cannot be caught or ignored)
    pub const SIGKILL: Signal = Signal(9);
    /// Bus error
    pub const SIGBUS: Signal = Signal(10);
    /// Segmentation violation
    pub const SIGSEGV: Signal = Signal(11);
    /// Bad system call
    pub const SIGSYS: Signal = Signal(12);
    /// Child status changed
    pub const SIGCHLD: Signal = Signal(20);

    /// Highest signal number
    pub const MAX: u8 = 32;

    /// Can the signal be caught, blocked or ignored?
    pub fn is_catchable(self) -> bool {
        self != Signal::SIGKILL
    }
}

/// Signal reason codes (`si_code`)
pub mod code {
    /// Privileged opcode
    pub const ILL_PRVOPC: i32 = 5;
    /// Internal stack error
    pub const ILL_BADSTK: i32 = 8;
    /// Branch target violation
    pub const ILL_BTCFI: i32 = 9;
    /// Integer divide by zero
    pub const FPE_INTDIV: i32 = 1;
    /// Invalid floating point operation
    pub const FPE_FLTINV: i32 = 7;
    /// Address not mapped
    pub const SEGV_MAPERR: i32 = 1;
    /// Invalid permissions for mapped object
    pub const SEGV_ACCERR: i32 = 2;
    /// Invalid address alignment
    pub const BUS_ADRALN: i32 = 1;
    /// Object-specific hardware error
    pub const BUS_OBJERR: i32 = 3;
    /// Process breakpoint
    pub const TRAP_BRKPT: i32 = 1;
    /// Process trace trap
    pub const TRAP_TRACE: i32 = 2;
    /// Sent by the kernel
    pub const SI_NOINFO: i32 = 32767;
}

/// A set of signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u32);

impl SigSet {
    /// Empty set
    pub const EMPTY: SigSet = SigSet(0);

    /// Raw mask
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw mask
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Add a signal
    pub fn add(&mut self, sig: Signal) {
        self.0 |= Self::bit(sig);
    }

    /// Is the signal in the set?
    pub fn contains(self, sig: Signal) -> bool {
        self.0 & Self::bit(sig) != 0
    }

    fn bit(sig: Signal) -> u32 {
        1u32.checked_shl(u32::from(sig.0).saturating_sub(1)).unwrap_or(0)
    }
}

/// Details of a posted signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    /// Signal number
    pub signo: Signal,
    /// Reason code
    pub code: i32,
    /// Trap number that raised it, if any
    pub trapno: u64,
    /// Faulting address or program counter
    pub addr: u64,
}

impl SigInfo {
    /// Signal raised by a trap
    pub const fn trap(signo: Signal, code: i32, trapno: u64, addr: u64) -> Self {
        Self {
            signo,
            code,
            trapno,
            addr,
        }
    }

    /// Signal sent by the kernel without trap details
    pub const fn kernel(signo: Signal) -> Self {
        Self {
            signo,
            code: code::SI_NOINFO,
            trapno: 0,
            addr: 0,
        }
    }
}

/// What a process does with a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Default action
    #[default]
    Default,
    /// Ignore it
    Ignore,
    /// Run a user handler
    Handler(u64),
}

/// Signal action table
#[derive(Debug, Default)]
pub struct SigActs {
    actions: Mutex<BTreeMap<u8, Disposition>>,
}

impl SigActs {
    /// All default actions
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the action for a signal; SIGKILL cannot be changed
    pub fn set(&self, sig: Signal, disposition: Disposition) -> bool {
        if !sig.is_catchable() {
            return false;
        }
        self.actions.lock().insert(sig.0, disposition);
        true
    }

    /// Action for a signal
    pub fn get(&self, sig: Signal) -> Disposition {
        self.actions.lock().get(&sig.0).copied().unwrap_or_default()
    }

    /// Independent copy
    pub fn copy(&self) -> Self {
        Self {
            actions: Mutex::new(self.actions.lock().clone()),
        }
    }
}

/// Signal delivery
pub trait SignalDelivery: Send + Sync + core::fmt::Debug {
    /// Post a signal raised by a trap to the faulting thread
    fn trapsignal(&self, thread: &Arc<Thread>, info: SigInfo);

    /// Post a kernel-generated signal to a thread
    fn psignal(&self, thread: &Arc<Thread>, sig: Signal);

    /// Act on signals pending for `thread` before it returns to user mode
    fn post_pending(&self, _thread: &Arc<Thread>) {}
}

/// Delivery that queues signals on the target thread
#[derive(Debug, Default)]
pub struct QueuedSignals;

impl SignalDelivery for QueuedSignals {
    fn trapsignal(&self, thread: &Arc<Thread>, info: SigInfo) {
        log::debug!(
            "trapsignal tid {} sig {} code {} addr {:#x}",
            thread.tid().as_u32(),
            info.signo.0,
            info.code,
            info.addr
        );
        thread.post_signal(info);
    }

    fn psignal(&self, thread: &Arc<Thread>, sig: Signal) {
        thread.post_signal(SigInfo::kernel(sig));
    }
}
