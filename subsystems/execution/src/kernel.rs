//! # Kernel State
//!
//! The handle every creation path runs against. It owns the registry,
//! admission control and fork statistics, and holds the collaborators
//! (scheduler, signal delivery, event sink, clock) behind trait objects.

use crate::admission::Admission;
use crate::config::ExecConfig;
use crate::cred::Credentials;
use crate::events::{EventQueue, EventSink, ProcessEvent};
use crate::fork::{ForkFlags, ForkStats, ForkStatsSnapshot, ThreadEntry};
use crate::limits::Limits;
use crate::process::{Process, ProcessFlags};
use crate::registry::Registry;
use crate::scheduler::{RunQueueScheduler, Scheduler, WaitChannel};
use crate::signal::{QueuedSignals, Signal, SignalDelivery};
use crate::thread::{KernelStack, Thread, ThreadFlags, ThreadState};
use crate::{ExecError, ExecResult, ProcessId};
use alloc::format;
use alloc::sync::Arc;
use kestrel_hal::{Clock, CpuId, CpuSet, Privilege, TrapFrame, TrapKind, VirtAddr};
use kestrel_memory::{AddressSpace, FramePool};

/// External collaborators
#[derive(Debug, Clone)]
pub struct Services {
    /// Scheduler
    pub scheduler: Arc<dyn Scheduler>,
    /// Signal delivery
    pub signals: Arc<dyn SignalDelivery>,
    /// Process event observers
    pub events: Arc<dyn EventSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// Run queue scheduler, queued signals and an event queue
    pub fn standard(cpu_count: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            scheduler: Arc::new(RunQueueScheduler::new(cpu_count)),
            signals: Arc::new(QueuedSignals),
            events: Arc::new(EventQueue::new()),
            clock,
        }
    }
}

/// Kernel state
#[derive(Debug)]
pub struct Kernel {
    pub(crate) config: ExecConfig,
    pub(crate) registry: Registry,
    pub(crate) admission: Admission,
    pub(crate) stats: ForkStats,
    pub(crate) services: Services,
    pub(crate) frames: Arc<FramePool>,
    kernel_space: Arc<AddressSpace>,
    cpus: CpuSet,
    swapper: Arc<Process>,
}

impl Kernel {
    /// Build process 0 and its thread and return the kernel handle
    ///
    /// Process 0 takes one thread slot and one process slot like any other.
    pub fn boot(
        config: ExecConfig,
        services: Services,
        frames: Arc<FramePool>,
        cpus: CpuSet,
    ) -> ExecResult<Self> {
        let config = config.validated();
        let admission = Admission::new(
            config.max_threads,
            config.max_processes,
            config.privileged_headroom,
            config.table_full_interval,
            Arc::clone(&services.clock),
        );
        let kernel_space = Arc::new(AddressSpace::kernel(Arc::clone(&frames)));
        let limits = Arc::new(Limits::new());
        let cred = Credentials::root();

        let swapper = {
            let thread_slot = admission.admit_thread(0)?;
            let process_slot = admission.admit_process(0, &*limits)?;
            let kstack = KernelStack::allocate(&frames, config.uarea_pages)?;
            process_slot.commit();
            thread_slot.commit();

            let thread0 = Arc::new(Thread::bootstrap(kstack, Arc::clone(&cred)));
            thread0.set_flag(ThreadFlags::SYSTEM);
            thread0.set_state(ThreadState::Running);
            thread0.set_cpu(CpuId::BOOT);
            Process::bootstrap(thread0, Arc::clone(&kernel_space), cred, limits)
        };

        let registry = Registry::new(&config);
        registry.insert_swapper(&swapper);
        registry.insert_thread(swapper.main_thread())?;

        log::info!(
            "kernel: process 0 up, {} cpu(s), {} thread / {} process slots",
            cpus.len(),
            config.max_threads,
            config.max_processes
        );

        Ok(Self {
            config,
            registry,
            admission,
            stats: ForkStats::new(),
            services,
            frames,
            kernel_space,
            cpus,
            swapper,
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Process and thread registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Admission control
    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Fork counters
    pub fn fork_stats(&self) -> ForkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Collaborators
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Frame pool
    pub fn frames(&self) -> &Arc<FramePool> {
        &self.frames
    }

    /// The kernel address space
    pub fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    /// CPUs
    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    /// Process 0
    pub fn swapper(&self) -> &Arc<Process> {
        &self.swapper
    }

    /// Thread 0
    pub fn thread0(&self) -> &Arc<Thread> {
        self.swapper.main_thread()
    }

    /// Switch to random pids (done once init is running)
    pub fn enable_random_pids(&self) {
        self.registry.set_random_pids(true);
    }

    /// Start a kernel thread running `func(arg)`
    pub fn kthread_create(&self, func: fn(usize), arg: usize, name: &str) -> ExecResult<Arc<Process>> {
        let process = self.fork_process(self.thread0(), ForkFlags::KTHREAD, ThreadEntry::Kernel { func, arg })?;
        process.set_name(name);
        Ok(process)
    }

    /// Create the idle thread for `cpu`; it is bound there, not queued
    pub fn create_idle_thread(&self, cpu: CpuId, idle: fn(usize)) -> ExecResult<Arc<Thread>> {
        let process = self.fork_process(
            self.thread0(),
            ForkFlags::KTHREAD | ForkFlags::IDLE,
            ThreadEntry::Kernel {
                func: idle,
                arg: cpu.index(),
            },
        )?;
        process.set_name(&format!("idle{}", cpu.index()));
        Ok(Arc::clone(process.main_thread()))
    }

    /// Replace `thread`'s process image with an empty user address space
    /// holding only a stack, and point the thread at `pc`
    ///
    /// Releases a waiting vfork parent.
    pub fn exec(
        &self,
        thread: &Arc<Thread>,
        pc: u64,
        stack_top: VirtAddr,
        stack_size: u64,
    ) -> ExecResult<Arc<AddressSpace>> {
        let process = thread.process().ok_or(ExecError::ProcessNotFound)?;
        let vm = Arc::new(AddressSpace::new_user(Arc::clone(&self.frames)));
        vm.map_stack(stack_top, stack_size)
            .map_err(|_| ExecError::InvalidArgument)?;
        process.replace_vm(Arc::clone(&vm));
        process.set_flag(ProcessFlags::EXEC);

        let mut frame = TrapFrame::new(TrapKind::Ast, Privilege::User);
        frame.pc = pc;
        frame.sp = stack_top.as_u64();
        thread.save_frame(&frame);

        self.exec_or_exit_release(&process);
        Ok(vm)
    }

    /// Clear a vfork wait on `child` and wake its parent
    pub fn exec_or_exit_release(&self, child: &Arc<Process>) {
        if !child.has_flag(ProcessFlags::PPWAIT) {
            return;
        }
        child.clear_flag(ProcessFlags::PPWAIT);
        if let Some(parent) = child.parent() {
            parent.clear_flag(ProcessFlags::ISPWAIT);
            self.services.scheduler.wakeup(WaitChannel::Process(parent.pid()));
        }
    }

    /// Exit one thread of a multi-threaded process
    ///
    /// The main thread exits by exiting the process.
    pub fn exit_thread(&self, thread: &Arc<Thread>) -> ExecResult<()> {
        let process = thread.process().ok_or(ExecError::ProcessNotFound)?;
        if Arc::ptr_eq(process.main_thread(), thread) {
            return self.exit_process(process.pid());
        }
        let tid = thread.tid();
        process.remove_thread(tid).ok_or(ExecError::ThreadNotFound)?;
        self.registry.unregister_thread(tid)?;
        thread.set_state(ThreadState::Zombie);
        self.admission.release_thread();
        Ok(())
    }

    /// Turn a process into a zombie
    ///
    /// Its pid stays taken until [`Kernel::reap`]. Children move to init.
    /// A `NOZOMBIE` process is reaped right away.
    pub fn exit_process(&self, pid: ProcessId) -> ExecResult<()> {
        if pid == ProcessId::SWAPPER {
            return Err(ExecError::InvalidArgument);
        }
        let process = self.registry.find_process(pid).ok_or(ExecError::ProcessNotFound)?;
        self.exec_or_exit_release(&process);

        let main = Arc::clone(process.main_thread());
        for thread in process.threads() {
            if !Arc::ptr_eq(&thread, &main) {
                self.exit_thread(&thread)?;
            }
        }
        main.set_state(ThreadState::Zombie);
        // Already gone if the thread never got an id.
        let _ = self.registry.unregister_thread(main.tid());

        let heir = self
            .registry
            .find_process(ProcessId::new(1))
            .filter(|init| init.pid() != pid)
            .unwrap_or_else(|| Arc::clone(&self.swapper));
        for child in process.children() {
            heir.adopt(&child);
        }

        self.registry.make_zombie(pid)?;
        self.services.events.notify(pid, ProcessEvent::Exit);
        log::debug!("exit: pid {}", pid);

        if process.has_flag(ProcessFlags::NOZOMBIE) {
            return self.reap(pid);
        }
        if let Some(parent) = process.parent() {
            self.services
                .signals
                .psignal(parent.main_thread(), Signal::SIGCHLD);
        }
        Ok(())
    }

    /// Remove a zombie and give back its slots; the pid goes to quarantine
    pub fn reap(&self, pid: ProcessId) -> ExecResult<()> {
        let process = self.registry.remove_zombie(pid)?;
        if let Some(parent) = process.parent() {
            parent.remove_child(pid);
        }
        self.admission.release_thread();
        self.admission.release_process(process.charged_uid());
        Ok(())
    }
}
