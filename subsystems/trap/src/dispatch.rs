//! # Trap Dispatch
//!
//! Entry points called by the architecture's exception stubs.
//!
//! | Entry                | From        | Ends in                              |
//! |----------------------|-------------|--------------------------------------|
//! | `handle_kernel_trap` | kernel mode | resume, debugger, or fatal           |
//! | `handle_user_trap`   | user mode   | signal or silent resume, then userret |
//! | `handle_syscall`     | user mode   | result encoded in the frame          |
//! | `handle_ast`         | user return | deferred work, then userret          |
//! | `child_return`       | new thread  | first return to user mode            |

use crate::classify::{classify_user_trap, UserTrapClass};
use crate::fault::{FaultResolver, KernelFault, UserFault};
use crate::hooks::TrapHooks;
use crate::recovery::RecoveryTable;
use crate::{TrapStats, TrapStatsSnapshot};
use alloc::sync::Arc;
use core::fmt;
use kestrel_execution::process::TraceEvent;
use kestrel_execution::signal::{code, SigInfo, Signal};
use kestrel_execution::{Kernel, ProcessFlags, Thread, ThreadFlags, ThreadState};
use kestrel_hal::trap::{reg, TrapName};
use kestrel_hal::{CpuId, CpuLocal, TrapFlags, TrapFrame, TrapKind, VirtAddr};

/// Routes traps, faults and syscalls
#[derive(Debug)]
pub struct TrapDispatcher {
    kernel: Arc<Kernel>,
    resolver: FaultResolver,
    hooks: TrapHooks,
    pub(crate) stats: TrapStats,
}

impl TrapDispatcher {
    /// Create a dispatcher for `kernel`
    pub fn new(kernel: Arc<Kernel>, hooks: TrapHooks, recovery: Arc<RecoveryTable>) -> Self {
        let resolver = FaultResolver::new(
            Arc::clone(kernel.kernel_space()),
            recovery,
            kernel.cpus().features(),
        );
        Self {
            kernel,
            resolver,
            hooks,
            stats: TrapStats::new(),
        }
    }

    /// The kernel traps are dispatched against
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Page fault resolver
    pub fn resolver(&self) -> &FaultResolver {
        &self.resolver
    }

    /// Collaborators
    pub fn hooks(&self) -> &TrapHooks {
        &self.hooks
    }

    /// Trap counters
    pub fn stats(&self) -> TrapStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn cpu_of(&self, thread: &Thread) -> &CpuLocal {
        self.kernel.cpus().get(thread.cpu().unwrap_or(CpuId::BOOT))
    }

    /// Offer the trap to the debugger; if it declines, dump and die
    fn toast(&self, frame: &mut TrapFrame, args: fmt::Arguments<'_>) {
        if self.hooks.offer_debugger(frame) {
            return;
        }
        frame.log("fatal kernel trap");
        self.hooks.diagnostics.fatal(args)
    }

    /// Handle a trap taken while the kernel was running
    ///
    /// Returns only if the trap was resolved or a debugger took it.
    pub fn handle_kernel_trap(&self, current: Option<&Arc<Thread>>, cpu: CpuId, frame: &mut TrapFrame) {
        self.stats.record_trap();
        match frame.kind() {
            Some(TrapKind::PageFault) => {
                self.kernel_page_fault(current, self.kernel.cpus().get(cpu), frame);
            }
            Some(TrapKind::Nmi) => {
                if self.hooks.offer_debugger(frame) || self.hooks.nmi.recover(frame) {
                    return;
                }
                frame.log("unrecovered NMI");
                let pc = frame.pc;
                self.hooks
                    .diagnostics
                    .fatal(format_args!("NMI not recovered, pc={:#x}", pc))
            }
            _ => {
                let (trapno, err, pc) = (frame.trapno, frame.err, frame.pc);
                self.toast(
                    frame,
                    format_args!(
                        "{}: trap type {}, code={:#x}, pc={:#x}",
                        TrapName(trapno),
                        trapno,
                        err,
                        pc
                    ),
                );
            }
        }
    }

    /// Resolve a kernel page fault; unhandled faults are fatal unless the
    /// debugger takes them
    pub(crate) fn kernel_page_fault(
        &self,
        current: Option<&Arc<Thread>>,
        cpu: &CpuLocal,
        frame: &mut TrapFrame,
    ) -> KernelFault {
        self.stats.record_fault();
        let outcome = self.resolver.resolve_kernel_fault(current, cpu, frame);
        match outcome {
            KernelFault::Resolved => {}
            KernelFault::Recovered(point) => {
                log::trace!(
                    "kernel fault at {:#x} resumes at {}",
                    frame.addr,
                    self.resolver.recovery().name(point)
                );
            }
            KernelFault::Unhandled(reason) => {
                self.toast(frame, format_args!("{}", reason));
            }
        }
        outcome
    }

    /// Handle a trap taken while `thread` was in user mode
    pub fn handle_user_trap(&self, thread: &Arc<Thread>, frame: &mut TrapFrame) {
        self.stats.record_trap();
        thread.save_frame(frame);

        match classify_user_trap(frame.kind(), frame.err) {
            UserTrapClass::Signal { signo, code } => {
                let info = SigInfo::trap(signo, code, frame.trapno, frame.pc);
                self.kernel.services().signals.trapsignal(thread, info);
            }
            UserTrapClass::PageFault => self.user_page_fault(thread, frame),
            UserTrapClass::Impossible => {
                frame.log("impossible trap");
                let trapno = frame.trapno;
                self.hooks
                    .diagnostics
                    .fatal(format_args!("impossible trap: {} ({})", TrapName(trapno), trapno))
            }
        }

        self.userret(thread, frame);
    }

    fn user_page_fault(&self, thread: &Arc<Thread>, frame: &TrapFrame) {
        self.stats.record_fault();
        let signals = &self.kernel.services().signals;

        let sp = VirtAddr::new(frame.sp);
        let sp_valid = thread
            .process()
            .is_some_and(|p| p.vm().check_stack_pointer(sp));
        if !sp_valid {
            log::debug!(
                "tid {}: stack pointer {:#x} outside any mapping",
                thread.tid().as_u32(),
                sp
            );
            let info = SigInfo::trap(Signal::SIGSEGV, code::SEGV_ACCERR, frame.trapno, frame.sp);
            signals.trapsignal(thread, info);
            return;
        }

        let access = FaultResolver::access_for(frame.fault_cause());
        match self
            .resolver
            .resolve_user_fault(thread, VirtAddr::new(frame.addr), access)
        {
            UserFault::Handled => {}
            UserFault::Signal { signo, code } => {
                let info = SigInfo::trap(signo, code, frame.trapno, frame.addr);
                signals.trapsignal(thread, info);
            }
        }
    }

    /// Run deferred work before `thread` returns to user mode on `cpu`
    pub fn handle_ast(&self, thread: &Arc<Thread>, cpu: CpuId, frame: &mut TrapFrame) {
        if !frame.from_user() {
            let pc = frame.pc;
            self.hooks
                .diagnostics
                .fatal(format_args!("ast: not returning to user mode, pc={:#x}", pc))
        }
        self.stats.record_soft();
        let process = thread.process();

        if thread.take_flag(ThreadFlags::OWEUPC)
            && process.as_ref().is_some_and(|p| p.prof_base().is_some())
        {
            thread.charge_prof_tick();
        }

        if self.kernel.cpus().get(cpu).take_resched() {
            self.kernel.services().scheduler.preempt(thread);
        }

        if let Some(process) = &process {
            if thread.refresh_cred(&process.cred()) {
                log::trace!("tid {}: credentials refreshed", thread.tid().as_u32());
            }
        }

        self.userret(thread, frame);
    }

    /// Build the frame a newly created thread first returns to user with
    ///
    /// The creating call reports 0 and success in the child.
    pub fn child_return(&self, thread: &Arc<Thread>) -> TrapFrame {
        let mut frame = thread.frame();
        frame.regs[reg::RET0] = 0;
        frame.flags.remove(TrapFlags::CARRY);

        let process = thread.process();
        let call = if thread.has_flag(ThreadFlags::THREAD) {
            "__tfork"
        } else if process.as_ref().is_some_and(|p| p.has_flag(ProcessFlags::PPWAIT)) {
            "vfork"
        } else {
            "fork"
        };
        log::trace!("tid {}: child return from {}", thread.tid().as_u32(), call);

        let report_fork = process.as_ref().is_some_and(|p| {
            p.has_flag(ProcessFlags::TRACED)
                && p.trace_state()
                    .is_some_and(|s| s.report_event == Some(TraceEvent::Fork))
        });
        if report_fork {
            self.kernel.services().signals.psignal(thread, Signal::SIGTRAP);
        }

        thread.set_state(ThreadState::Running);
        self.userret(thread, &frame);
        frame
    }

    /// Common tail of every return to user mode
    pub(crate) fn userret(&self, thread: &Arc<Thread>, frame: &TrapFrame) {
        self.kernel.services().signals.post_pending(thread);
        thread.save_frame(frame);
    }
}
