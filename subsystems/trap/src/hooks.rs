//! # Trap Hooks
//!
//! Collaborators the dispatcher calls out to when a trap cannot be handled
//! by the kernel proper.

use alloc::sync::Arc;
use core::fmt;
use kestrel_hal::TrapFrame;

/// Kernel debugger
pub trait Debugger: Send + Sync + fmt::Debug {
    /// Offer a trap to the debugger
    ///
    /// Returns true when the debugger dealt with it and the interrupted
    /// context may resume.
    fn trap_entry(&self, trapno: u64, frame: &mut TrapFrame) -> bool;
}

/// Fatal error reporting
pub trait Diagnostics: Send + Sync + fmt::Debug {
    /// Record the failure and stop this execution context
    fn fatal(&self, args: fmt::Arguments<'_>) -> !;
}

/// Machine-specific NMI recovery
pub trait NmiRecovery: Send + Sync + fmt::Debug {
    /// Try to recover from a non-maskable interrupt
    fn recover(&self, frame: &TrapFrame) -> bool;
}

/// Logs the failure and panics
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicDiagnostics;

impl Diagnostics for PanicDiagnostics {
    fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        log::error!("fatal: {}", args);
        panic!("{}", args)
    }
}

/// No machine-specific recovery
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNmiRecovery;

impl NmiRecovery for NoNmiRecovery {
    fn recover(&self, _frame: &TrapFrame) -> bool {
        false
    }
}

/// The dispatcher's collaborators
#[derive(Debug, Clone)]
pub struct TrapHooks {
    /// Attached debugger, if any
    pub debugger: Option<Arc<dyn Debugger>>,
    /// Fatal error path
    pub diagnostics: Arc<dyn Diagnostics>,
    /// NMI recovery
    pub nmi: Arc<dyn NmiRecovery>,
}

impl TrapHooks {
    /// No debugger, panicking diagnostics, no NMI recovery
    pub fn new() -> Self {
        Self {
            debugger: None,
            diagnostics: Arc::new(PanicDiagnostics),
            nmi: Arc::new(NoNmiRecovery),
        }
    }

    /// Attach a debugger
    pub fn with_debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    /// Use machine-specific NMI recovery
    pub fn with_nmi_recovery(mut self, nmi: Arc<dyn NmiRecovery>) -> Self {
        self.nmi = nmi;
        self
    }

    /// Give the debugger a chance at the trap
    pub fn offer_debugger(&self, frame: &mut TrapFrame) -> bool {
        match &self.debugger {
            Some(debugger) => debugger.trap_entry(frame.trapno, frame),
            None => false,
        }
    }
}

impl Default for TrapHooks {
    fn default() -> Self {
        Self::new()
    }
}
