//! # Fork
//!
//! Process and thread creation.
//!
//! Creation runs in two phases. [`Kernel::admit_fork`] takes the thread
//! slot, the process slot, a tid and the kernel stack, and a process fork
//! then reserves its pid. These are the only steps that can fail, and
//! everything taken is given back if one does. The resulting
//! [`ForkAdmission`] is consumed by the construction phase, which has no
//! error path.

use crate::admission::{ProcessTicket, ThreadTicket};
use crate::events::ProcessEvent;
use crate::ids::THREAD_PID_OFFSET;
use crate::kernel::Kernel;
use crate::limits::LimitStore;
use crate::process::{Process, ProcessFlags, TraceEvent, TraceState, AFORK};
use crate::registry::{PidReservation, TidReservation};
use crate::scheduler::{Priority, WaitChannel};
use crate::signal::Signal;
use crate::thread::{KernelStack, Thread, ThreadFlags};
use crate::{ExecError, ExecResult, ProcessId, ThreadId};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::{CpuId, VirtAddr};

/// Fork flags
pub mod flags {
    use bitflags::bitflags;

    bitflags! {
        /// How a new process relates to its parent
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ForkFlags: u32 {
            /// Plain fork
            const FORK = 0x0001;
            /// vfork
            const VFORK = 0x0002;
            /// Idle thread; bind to a CPU instead of queueing
            const IDLE = 0x0004;
            /// Parent waits for the child's exec or exit
            const PPWAIT = 0x0008;
            /// Share the descriptor table
            const SHARE_FILES = 0x0010;
            /// Kernel process
            const SYSTEM = 0x0020;
            /// Parent will not wait for the child
            const NOZOMBIE = 0x0040;
            /// Share the address space
            const SHARE_VM = 0x0080;
            /// Share the signal actions
            const SHARE_SIGHAND = 0x0200;
            /// Report the fork to the debugger
            const PTRACE = 0x0400;

            /// What a kernel thread is created with
            const KTHREAD = Self::SHARE_VM.bits()
                | Self::SHARE_FILES.bits()
                | Self::SHARE_SIGHAND.bits()
                | Self::NOZOMBIE.bits()
                | Self::SYSTEM.bits();
        }
    }
}

pub use flags::ForkFlags;

/// Where a new thread starts when first scheduled
#[derive(Debug, Clone, Copy)]
pub enum ThreadEntry {
    /// Return to user mode reporting 0 from the creating call
    ChildReturn,
    /// Run a kernel function
    Kernel {
        /// Function
        func: fn(usize),
        /// Argument
        arg: usize,
    },
}

/// Fork counters
#[derive(Debug, Default)]
pub struct ForkStats {
    forks: AtomicU64,
    fork_pages: AtomicU64,
    vforks: AtomicU64,
    vfork_pages: AtomicU64,
    tforks: AtomicU64,
    kthreads: AtomicU64,
    ppwait: AtomicU64,
    sharevm: AtomicU64,
}

/// Point-in-time copy of [`ForkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkStatsSnapshot {
    /// fork calls
    pub forks: u64,
    /// Data and stack pages of fork children
    pub fork_pages: u64,
    /// vfork calls
    pub vforks: u64,
    /// Data and stack pages of vfork children
    pub vfork_pages: u64,
    /// Threads created in existing processes
    pub tforks: u64,
    /// Kernel threads
    pub kthreads: u64,
    /// Forks whose parent waited
    pub ppwait: u64,
    /// Forks sharing the address space
    pub sharevm: u64,
}

impl ForkStats {
    /// Zeroed counters
    pub const fn new() -> Self {
        Self {
            forks: AtomicU64::new(0),
            fork_pages: AtomicU64::new(0),
            vforks: AtomicU64::new(0),
            vfork_pages: AtomicU64::new(0),
            tforks: AtomicU64::new(0),
            kthreads: AtomicU64::new(0),
            ppwait: AtomicU64::new(0),
            sharevm: AtomicU64::new(0),
        }
    }

    fn record_process(&self, flags: ForkFlags, pages: u64) {
        if flags.contains(ForkFlags::FORK) {
            self.forks.fetch_add(1, Ordering::Relaxed);
            self.fork_pages.fetch_add(pages, Ordering::Relaxed);
        } else if flags.contains(ForkFlags::VFORK) {
            self.vforks.fetch_add(1, Ordering::Relaxed);
            self.vfork_pages.fetch_add(pages, Ordering::Relaxed);
        } else {
            self.kthreads.fetch_add(1, Ordering::Relaxed);
        }
        if flags.contains(ForkFlags::PPWAIT) {
            self.ppwait.fetch_add(1, Ordering::Relaxed);
        }
        if flags.contains(ForkFlags::SHARE_VM) {
            self.sharevm.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_thread(&self) {
        self.tforks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> ForkStatsSnapshot {
        ForkStatsSnapshot {
            forks: self.forks.load(Ordering::Relaxed),
            fork_pages: self.fork_pages.load(Ordering::Relaxed),
            vforks: self.vforks.load(Ordering::Relaxed),
            vfork_pages: self.vfork_pages.load(Ordering::Relaxed),
            tforks: self.tforks.load(Ordering::Relaxed),
            kthreads: self.kthreads.load(Ordering::Relaxed),
            ppwait: self.ppwait.load(Ordering::Relaxed),
            sharevm: self.sharevm.load(Ordering::Relaxed),
        }
    }
}

/// Everything a new thread (and process) needs that could run out
///
/// Dropping it gives the slots back, process slot first.
#[derive(Debug)]
#[must_use = "dropping an admission releases its slots"]
pub struct ForkAdmission<'a> {
    // Field order is drop order.
    process: Option<ProcessTicket<'a>>,
    thread: ThreadTicket<'a>,
    tid: TidReservation<'a>,
    kstack: KernelStack,
}

impl<'a> ForkAdmission<'a> {
    fn commit(self) -> (KernelStack, TidReservation<'a>) {
        let ForkAdmission {
            thread,
            process,
            tid,
            kstack,
        } = self;
        if let Some(process) = process {
            process.commit();
        }
        thread.commit();
        (kstack, tid)
    }
}

/// Copy the parent's saved context into the child and fix its start point
///
/// A custom user stack and TLS base are baked into the copy.
pub fn cpu_fork(parent: &Thread, child: &Thread, stack: Option<VirtAddr>, tcb: u64, entry: ThreadEntry) {
    let mut frame = parent.frame();
    if let Some(sp) = stack {
        frame.sp = sp.as_u64();
    }
    child.save_frame(&frame);
    child.set_tcb(if stack.is_some() { tcb } else { parent.tcb() });
    child.set_entry(entry);
}

impl Kernel {
    /// Take a thread slot, optionally a process slot, a tid and a kernel stack
    ///
    /// Thread admission comes first. If a later step fails, whatever was
    /// taken is given back.
    pub fn admit_fork(&self, uid: u32, process_limits: Option<&dyn LimitStore>) -> ExecResult<ForkAdmission<'_>> {
        let thread = self.admission.admit_thread(uid)?;
        let process = match process_limits {
            Some(limits) => Some(self.admission.admit_process(uid, limits)?),
            None => None,
        };
        let tid = self.registry.reserve_tid()?;
        let kstack = KernelStack::allocate(&self.frames, self.config.uarea_pages)?;
        Ok(ForkAdmission {
            process,
            thread,
            tid,
            kstack,
        })
    }

    /// Create a new process from `caller`'s process
    ///
    /// Returns the child's pid. Only admission and the pid draw can fail;
    /// see [`Kernel::admit_fork`].
    pub fn fork1(&self, caller: &Arc<Thread>, flags: ForkFlags, entry: ThreadEntry) -> ExecResult<ProcessId> {
        self.fork_process(caller, flags, entry).map(|p| p.pid())
    }

    pub(crate) fn fork_process(
        &self,
        caller: &Arc<Thread>,
        flags: ForkFlags,
        entry: ThreadEntry,
    ) -> ExecResult<Arc<Process>> {
        let parent = caller.process().ok_or(ExecError::ProcessNotFound)?;
        let uid = caller.cred().ruid;
        let limits: &dyn LimitStore = &**parent.limits();
        let admission = self.admit_fork(uid, Some(limits))?;
        let pid = self.registry.reserve_pid()?;
        Ok(self.fork_committed(admission, pid, uid, caller, &parent, flags, entry))
    }

    #[allow(clippy::too_many_arguments)]
    fn fork_committed(
        &self,
        admission: ForkAdmission<'_>,
        pid: PidReservation<'_>,
        uid: u32,
        caller: &Arc<Thread>,
        parent: &Arc<Process>,
        flags: ForkFlags,
        entry: ThreadEntry,
    ) -> Arc<Process> {
        let (kstack, tid) = admission.commit();
        let pid = pid.commit();

        let thread = Arc::new(Thread::fork_from(caller, kstack));
        let child = Process::fork_from(pid, parent, &thread, flags);
        child.set_charged_uid(uid);
        if child.has_flag(ProcessFlags::SYSTEM) {
            thread.set_flag(ThreadFlags::SYSTEM);
        }

        if flags.contains(ForkFlags::PPWAIT) {
            child.set_flag(ProcessFlags::PPWAIT);
            parent.set_flag(ProcessFlags::ISPWAIT);
        }

        cpu_fork(caller, &thread, None, 0, entry);

        let tid = self.registry.register_thread(&thread, tid);
        parent.add_child(&child);

        if child.has_flag(ProcessFlags::TRACED) {
            child.set_oppid(parent.pid());
            if let Some(tracer) = parent.parent() {
                tracer.adopt(&child);
            }
            parent.set_trace_state(Some(TraceState {
                report_event: Some(TraceEvent::Fork),
                other_pid: Some(pid),
            }));
            child.set_trace_state(Some(TraceState {
                report_event: Some(TraceEvent::Fork),
                other_pid: Some(parent.pid()),
            }));
        }

        self.registry.publish_process(&child);

        let vm = child.vm();
        self.stats
            .record_process(flags, vm.dsize_pages() + vm.ssize_pages());

        child.set_start_ticks(self.services.clock.now_ticks());
        child.set_acflag(AFORK);
        child.clear_flag(ProcessFlags::EMBRYO);

        match (flags.contains(ForkFlags::IDLE), entry) {
            (true, ThreadEntry::Kernel { arg, .. }) => {
                self.services.scheduler.bind_to_cpu(&thread, CpuId(arg as u32));
            }
            _ => {
                let cpu = self.services.scheduler.choose_cpu(&thread);
                self.services.scheduler.enqueue_runnable(&thread, cpu);
            }
        }

        self.services
            .events
            .notify(parent.pid(), ProcessEvent::Fork { child: pid });

        log::debug!(
            "fork: pid {} -> pid {} tid {} flags {:?}",
            parent.pid(),
            pid,
            tid.as_u32(),
            flags
        );

        if flags.contains(ForkFlags::PPWAIT) {
            let waiting = Arc::clone(&child);
            let priority = caller.priority();
            caller.set_priority(Priority::PWAIT);
            self.services.scheduler.sleep(
                caller,
                WaitChannel::Process(parent.pid()),
                &move || waiting.has_flag(ProcessFlags::PPWAIT),
            );
            caller.set_priority(priority);
        }

        if flags.contains(ForkFlags::PTRACE) && parent.has_flag(ProcessFlags::TRACED) {
            self.services.signals.psignal(caller, Signal::SIGTRAP);
        }

        child
    }

    /// Create a new thread in `caller`'s process
    ///
    /// The thread starts on `stack` with `tcb` as its TLS base. If `tidptr`
    /// is given the user-visible tid is stored there; a failed store raises
    /// SIGSEGV on the caller but does not undo the thread.
    pub fn thread_fork(
        &self,
        caller: &Arc<Thread>,
        stack: Option<VirtAddr>,
        tcb: u64,
        tidptr: Option<VirtAddr>,
    ) -> ExecResult<ThreadId> {
        let stack = stack.ok_or(ExecError::InvalidArgument)?;
        let process = caller.process().ok_or(ExecError::ProcessNotFound)?;
        let admission = self.admit_fork(caller.cred().ruid, None)?;
        let (kstack, tid) = admission.commit();

        let thread = Arc::new(Thread::fork_from(caller, kstack));
        thread.set_flag(ThreadFlags::THREAD);
        cpu_fork(caller, &thread, Some(stack), tcb, ThreadEntry::ChildReturn);
        thread.set_process(&process);

        let tid = self.registry.register_thread(&thread, tid);
        // A thread created during a single-threading request must stop too.
        process.attach_thread(&thread);
        self.stats.record_thread();

        let user_tid = u64::from(tid.as_u32() + THREAD_PID_OFFSET);
        if let Some(ptr) = tidptr {
            if process.vm().copyout_word(ptr, user_tid).is_err() {
                self.services.signals.psignal(caller, Signal::SIGSEGV);
            }
        }

        let cpu = self.services.scheduler.choose_cpu(&thread);
        self.services.scheduler.enqueue_runnable(&thread, cpu);

        log::debug!("thread_fork: pid {} tid {}", process.pid(), tid.as_u32());
        Ok(tid)
    }
}
