//! # Trap Scenario Tests
//!
//! Whole-kernel scenarios for trap dispatch, fault resolution and the
//! syscall gate.

#[cfg(test)]
mod tests {
    extern crate std;

    use crate::hooks::{Debugger, NmiRecovery, TrapHooks};
    use crate::recovery::{RecoveryTable, COPY_FAULT};
    use crate::syscall::SysError;
    use crate::sysent::{SYS_FORK, SYS_GETPID, SYS_GETPPID, SYS_GETTHRID, SYS_GETUID, SYS_MMAP, SYS___SYSCALL, SYS___TFORK};
    use crate::{KernelFault, TrapDispatcher};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use kestrel_execution::cred::Credentials;
    use kestrel_execution::errno::{EFAULT, EINVAL, ENOSYS};
    use kestrel_execution::ids::THREAD_PID_OFFSET;
    use kestrel_execution::process::{Process, TraceEvent};
    use kestrel_execution::scheduler::RunQueueScheduler;
    use kestrel_execution::signal::{code, SigInfo, Signal};
    use kestrel_execution::{
        ExecConfig, ForkFlags, Kernel, ProcessFlags, Services, Thread, ThreadEntry, ThreadFlags, ThreadId,
        TraceMask,
    };
    use kestrel_hal::{
        CpuFeatures, CpuId, CpuSet, FaultCause, Privilege, TickClock, TrapFlags, TrapFrame, TrapKind, VirtAddr,
        KERNEL_BASE, PAGE_SIZE,
    };
    use kestrel_memory::{FramePool, ProtectionFlags, STACK_GUARD_TOLERANCE};

    const STACK_TOP: u64 = 0x7fff_0000_0000;
    const STACK_PAGES: u64 = 16;
    const STACK_FLOOR: u64 = STACK_TOP - STACK_PAGES * PAGE_SIZE;
    const TEXT: u64 = 0x40_0000;
    const DATA: u64 = 0x1000_0000;

    // =========================================================================
    // Helpers
    // =========================================================================

    struct Machine {
        kernel: Arc<Kernel>,
        traps: TrapDispatcher,
        scheduler: Arc<RunQueueScheduler>,
    }

    fn machine_with(features: CpuFeatures, hooks: TrapHooks) -> Machine {
        smp_machine(1, features, hooks)
    }

    fn smp_machine(cpus: u32, features: CpuFeatures, hooks: TrapHooks) -> Machine {
        let scheduler = Arc::new(RunQueueScheduler::new(cpus as usize));
        let mut services = Services::standard(cpus as usize, Arc::new(TickClock::new()));
        services.scheduler = scheduler.clone();
        let kernel = Arc::new(
            Kernel::boot(
                ExecConfig::default(),
                services,
                Arc::new(FramePool::new(4096)),
                CpuSet::new(cpus, features),
            )
            .unwrap(),
        );
        let traps = TrapDispatcher::new(Arc::clone(&kernel), hooks, Arc::new(RecoveryTable::with_defaults()));
        Machine {
            kernel,
            traps,
            scheduler,
        }
    }

    fn machine() -> Machine {
        machine_with(CpuFeatures::full(), TrapHooks::new())
    }

    /// A user process with an empty image and a stack, running as uid 1000
    fn spawn_user(kernel: &Kernel) -> (Arc<Process>, Arc<Thread>) {
        let pid = kernel
            .fork1(kernel.thread0(), ForkFlags::FORK, ThreadEntry::ChildReturn)
            .unwrap();
        let process = kernel.registry().find_process(pid).unwrap();
        let main = Arc::clone(process.main_thread());
        kernel
            .exec(&main, TEXT, VirtAddr::new(STACK_TOP), STACK_PAGES * PAGE_SIZE)
            .unwrap();
        let cred = Credentials::user(1000, 1000);
        process.set_cred(Arc::clone(&cred));
        main.set_cred(cred);
        (process, main)
    }

    fn user_syscall(code: usize, args: &[u64]) -> TrapFrame {
        let mut frame = TrapFrame::syscall(code as u64, args);
        frame.pc = TEXT + 0x10;
        frame.sp = STACK_TOP - PAGE_SIZE;
        frame
    }

    fn user_fault(addr: u64, cause: FaultCause) -> TrapFrame {
        let mut frame = TrapFrame::page_fault(Privilege::User, addr, cause | FaultCause::USER);
        frame.pc = TEXT;
        frame.sp = STACK_TOP - 64;
        frame
    }

    fn signals(thread: &Thread) -> std::vec::Vec<Signal> {
        thread.pending_signals().iter().map(|s: &SigInfo| s.signo).collect()
    }

    fn carry(frame: &TrapFrame) -> bool {
        frame.flags.contains(TrapFlags::CARRY)
    }

    #[derive(Debug, Default)]
    struct CountingDebugger {
        entries: AtomicUsize,
    }

    impl Debugger for CountingDebugger {
        fn trap_entry(&self, _trapno: u64, _frame: &mut TrapFrame) -> bool {
            self.entries.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[derive(Debug)]
    struct AlwaysRecover;

    impl NmiRecovery for AlwaysRecover {
        fn recover(&self, _frame: &TrapFrame) -> bool {
            true
        }
    }

    // =========================================================================
    // Syscall gate
    // =========================================================================

    #[test]
    fn test_syscall_success_and_error_convention() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);

        let mut frame = user_syscall(SYS_GETPID, &[]);
        frame.flags.insert(TrapFlags::CARRY);
        m.traps.handle_syscall(&main, &mut frame);
        assert_eq!(frame.ret0(), u64::from(process.pid().as_u32()));
        assert!(!carry(&frame));

        let mut frame = user_syscall(SYS___TFORK, &[STACK_TOP - PAGE_SIZE, 0]);
        m.traps.handle_syscall(&main, &mut frame);
        assert_eq!(frame.ret0(), EINVAL as u64);
        assert!(carry(&frame));
        assert_eq!(frame.pc, TEXT + 0x10);

        assert_eq!(m.traps.stats().syscalls, 2);
    }

    #[test]
    fn test_identity_calls() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);

        let mut frame = user_syscall(SYS_GETUID, &[]);
        m.traps.handle_syscall(&main, &mut frame);
        assert_eq!(frame.ret0(), 1000);

        let mut frame = user_syscall(SYS_GETPPID, &[]);
        m.traps.handle_syscall(&main, &mut frame);
        assert_eq!(frame.ret0(), u64::from(process.ppid().as_u32()));

        let mut frame = user_syscall(SYS_GETTHRID, &[]);
        m.traps.handle_syscall(&main, &mut frame);
        assert_eq!(frame.ret0(), u64::from(main.tid().as_u32() + THREAD_PID_OFFSET));
    }

    #[test]
    fn test_unknown_syscall_raises_sigsys() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);

        for code in [1usize, 500, 100_000] {
            let mut frame = user_syscall(code, &[]);
            m.traps.handle_syscall(&main, &mut frame);
            assert_eq!(frame.ret0(), ENOSYS as u64);
            assert!(carry(&frame));
        }
        assert_eq!(signals(&main), [Signal::SIGSYS; 3]);
    }

    #[test]
    fn test_indirect_syscall() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);

        for indirect in [0usize, SYS___SYSCALL] {
            let mut frame = user_syscall(indirect, &[SYS_GETPID as u64]);
            m.traps.handle_syscall(&main, &mut frame);
            assert_eq!(frame.ret0(), u64::from(process.pid().as_u32()));
            assert!(!carry(&frame));
        }
    }

    #[test]
    fn test_stack_arguments_are_copied_in() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        let vm = process.vm();

        // Seven arguments: six in registers, the offset on the stack.
        let sp = STACK_TOP - PAGE_SIZE;
        vm.copyout_word(VirtAddr::new(sp + 8), 0).unwrap();
        let flags = 0x1000 | 0x0010;
        let mut frame = user_syscall(SYS_MMAP, &[DATA, PAGE_SIZE, 3, flags, u64::MAX, 0]);
        m.traps.handle_syscall(&main, &mut frame);
        assert!(!carry(&frame));
        assert_eq!(frame.ret0(), DATA);
        let region = vm.find_region(VirtAddr::new(DATA)).unwrap();
        assert_eq!(region.protection, ProtectionFlags::RW);
    }

    #[test]
    fn test_indirect_call_spills_onto_a_fresh_stack_page() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        let vm = process.vm();
        let faults_before = m.traps.stats().faults;

        // Shifting by one leaves five register arguments; two come from a
        // stack page that has never been touched.
        let flags = 0x1000 | 0x0010;
        let mut frame = user_syscall(SYS___SYSCALL, &[SYS_MMAP as u64, DATA, PAGE_SIZE, 1, flags, u64::MAX]);
        frame.sp = STACK_TOP - 2 * PAGE_SIZE;
        assert_eq!(vm.read_word(VirtAddr::new(frame.sp + 8)), Err(kestrel_memory::MemError::WouldFault));

        m.traps.handle_syscall(&main, &mut frame);
        assert!(!carry(&frame));
        assert_eq!(frame.ret0(), DATA);
        assert!(m.traps.stats().faults > faults_before);
        assert_eq!(main.onfault(), 0);
    }

    #[test]
    fn test_bad_stack_arguments_fail_with_efault() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);

        let mut frame = user_syscall(SYS_MMAP, &[DATA, PAGE_SIZE, 3, 0x1010, u64::MAX, 0]);
        frame.sp = 0x3000_0000;
        m.traps.handle_syscall(&main, &mut frame);
        assert!(carry(&frame));
        assert_eq!(frame.ret0(), EFAULT as u64);
        assert_eq!(main.onfault(), 0);
    }

    #[test]
    fn test_fork_through_the_gate() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);

        let mut frame = user_syscall(SYS_FORK, &[]);
        m.traps.handle_syscall(&main, &mut frame);
        assert!(!carry(&frame));
        let pid = kestrel_execution::ProcessId::new(frame.ret0() as u32);
        let child = m.kernel.registry().find_process(pid).unwrap();
        let child_main = Arc::clone(child.main_thread());

        let child_frame = m.traps.child_return(&child_main);
        assert_eq!(child_frame.ret0(), 0);
        assert!(!carry(&child_frame));
        assert_eq!(child_frame.pc, frame.pc);
        assert_eq!(child_frame.sp, frame.sp);
        assert_eq!(child_main.frame().ret0(), 0);
    }

    #[test]
    fn test_tfork_through_the_gate() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        let vm = process.vm();

        let param = STACK_TOP - 2 * PAGE_SIZE;
        let tidptr = STACK_TOP - 3 * PAGE_SIZE;
        let stack = STACK_TOP - 8 * PAGE_SIZE;
        for (i, word) in [0x5000, tidptr, stack].into_iter().enumerate() {
            vm.copyout_word(VirtAddr::new(param + 8 * i as u64), word).unwrap();
        }

        let mut frame = user_syscall(SYS___TFORK, &[param, 24]);
        m.traps.handle_syscall(&main, &mut frame);
        assert!(!carry(&frame));
        let user_tid = frame.ret0();
        assert_eq!(vm.read_word(VirtAddr::new(tidptr)), Ok(user_tid));

        let tid = ThreadId::new((user_tid - u64::from(THREAD_PID_OFFSET)) as u32);
        let thread = m.kernel.registry().find_thread(tid).unwrap();
        assert_eq!(thread.tcb(), 0x5000);
        assert_eq!(process.threads().len(), 2);

        let child_frame = m.traps.child_return(&thread);
        assert_eq!(child_frame.sp, stack);
        assert_eq!(child_frame.ret0(), 0);
    }

    // =========================================================================
    // User traps and page faults
    // =========================================================================

    #[test]
    fn test_user_trap_becomes_signal() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);

        let mut frame = TrapFrame::new(TrapKind::Divide, Privilege::User);
        frame.pc = TEXT + 0x44;
        m.traps.handle_user_trap(&main, &mut frame);

        let pending = main.pending_signals();
        assert_eq!(
            pending[..],
            [SigInfo::trap(Signal::SIGFPE, code::FPE_INTDIV, TrapKind::Divide.number(), TEXT + 0x44)]
        );
        assert_eq!(m.traps.stats().traps, 1);
    }

    #[test]
    #[should_panic(expected = "impossible trap")]
    fn test_impossible_user_trap_is_fatal() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        let mut frame = TrapFrame::new(TrapKind::DoubleFault, Privilege::User);
        m.traps.handle_user_trap(&main, &mut frame);
    }

    #[test]
    fn test_user_fault_in_stack_resolves_silently() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);

        let addr = STACK_TOP - 5 * PAGE_SIZE + 16;
        let mut frame = user_fault(addr, FaultCause::WRITE);
        m.traps.handle_user_trap(&main, &mut frame);
        assert!(main.pending_signals().is_empty());
        assert!(process.vm().write_word(VirtAddr::new(addr), 1).is_ok());
        assert_eq!(process.vm().ssize_pages(), 5);
    }

    #[test]
    fn test_user_fault_outside_mappings_is_segv() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);

        let mut frame = user_fault(0x5000_0000, FaultCause::empty());
        m.traps.handle_user_trap(&main, &mut frame);
        let pending = main.pending_signals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].signo, Signal::SIGSEGV);
        assert_eq!(pending[0].code, code::SEGV_MAPERR);
        assert_eq!(pending[0].addr, 0x5000_0000);
    }

    #[test]
    fn test_write_to_read_only_is_accerr() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        process
            .vm()
            .map_anonymous(VirtAddr::new(DATA), PAGE_SIZE, ProtectionFlags::READ)
            .unwrap();

        let mut frame = user_fault(DATA, FaultCause::WRITE);
        m.traps.handle_user_trap(&main, &mut frame);
        let pending = main.pending_signals();
        assert_eq!((pending[0].signo, pending[0].code), (Signal::SIGSEGV, code::SEGV_ACCERR));
    }

    #[test]
    fn test_io_error_is_sigbus() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        process
            .vm()
            .map_file(VirtAddr::new(DATA), PAGE_SIZE, ProtectionFlags::READ, true)
            .unwrap();

        let mut frame = user_fault(DATA, FaultCause::empty());
        m.traps.handle_user_trap(&main, &mut frame);
        let pending = main.pending_signals();
        assert_eq!((pending[0].signo, pending[0].code), (Signal::SIGBUS, code::BUS_OBJERR));
    }

    #[test]
    fn test_execute_only_mapping_without_nx() {
        let legacy = machine_with(CpuFeatures::legacy(), TrapHooks::new());
        let (process, main) = spawn_user(&legacy.kernel);
        let vm = process.vm();
        vm.map_anonymous(VirtAddr::new(DATA), PAGE_SIZE, ProtectionFlags::EXECUTE)
            .unwrap();
        let faults = vm.fault_count();
        let mut frame = user_fault(DATA, FaultCause::empty());
        legacy.traps.handle_user_trap(&main, &mut frame);
        assert!(main.pending_signals().is_empty());
        // The read is retried as an execute once.
        assert_eq!(vm.fault_count(), faults + 2);

        let nx = machine();
        let (process, main) = spawn_user(&nx.kernel);
        let vm = process.vm();
        vm.map_anonymous(VirtAddr::new(DATA), PAGE_SIZE, ProtectionFlags::EXECUTE)
            .unwrap();
        let faults = vm.fault_count();
        let mut frame = user_fault(DATA, FaultCause::empty());
        nx.traps.handle_user_trap(&main, &mut frame);
        assert_eq!(signals(&main), [Signal::SIGSEGV]);
        assert_eq!(vm.fault_count(), faults + 1);
    }

    #[test]
    fn test_inaccessible_page_without_nx_retries_once() {
        let legacy = machine_with(CpuFeatures::legacy(), TrapHooks::new());
        let (process, main) = spawn_user(&legacy.kernel);
        let vm = process.vm();
        vm.map_anonymous(VirtAddr::new(DATA), PAGE_SIZE, ProtectionFlags::NONE)
            .unwrap();
        let faults = vm.fault_count();

        let mut frame = user_fault(DATA, FaultCause::empty());
        legacy.traps.handle_user_trap(&main, &mut frame);

        let pending = main.pending_signals();
        assert_eq!(pending.len(), 1);
        assert_eq!((pending[0].signo, pending[0].code), (Signal::SIGSEGV, code::SEGV_ACCERR));
        assert_eq!(vm.fault_count(), faults + 2);
    }

    #[test]
    fn test_stack_pointer_far_below_stack_is_rejected_before_resolution() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        let vm = process.vm();
        let faults = vm.fault_count();

        let wild = STACK_FLOOR - STACK_GUARD_TOLERANCE - 4 * PAGE_SIZE;
        let mut frame = user_fault(wild, FaultCause::WRITE);
        frame.sp = wild;
        m.traps.handle_user_trap(&main, &mut frame);

        let pending = main.pending_signals();
        assert_eq!((pending[0].signo, pending[0].code), (Signal::SIGSEGV, code::SEGV_ACCERR));
        assert_eq!(vm.fault_count(), faults);
    }

    #[test]
    fn test_stack_pointer_within_tolerance_reaches_resolver() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        let vm = process.vm();
        let faults = vm.fault_count();

        let near = STACK_FLOOR - 4 * PAGE_SIZE;
        let mut frame = user_fault(near, FaultCause::WRITE);
        frame.sp = near;
        m.traps.handle_user_trap(&main, &mut frame);

        assert_eq!(vm.fault_count(), faults + 1);
        let pending = main.pending_signals();
        assert_eq!(pending[0].code, code::SEGV_MAPERR);
    }

    #[test]
    fn test_out_of_memory_kills() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        let frames = m.kernel.frames();
        frames.try_take(frames.free()).unwrap();

        let mut frame = user_fault(STACK_TOP - 3 * PAGE_SIZE, FaultCause::WRITE);
        m.traps.handle_user_trap(&main, &mut frame);
        let pending = main.pending_signals();
        assert_eq!((pending[0].signo, pending[0].code), (Signal::SIGKILL, code::SI_NOINFO));
    }

    #[test]
    fn test_cow_break_after_fork() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        let addr = VirtAddr::new(STACK_TOP - PAGE_SIZE);
        process.vm().copyout_word(addr, 7).unwrap();

        let mut frame = user_syscall(SYS_FORK, &[]);
        m.traps.handle_syscall(&main, &mut frame);
        assert!(process.vm().is_cow(addr));

        let mut fault = user_fault(addr.as_u64(), FaultCause::WRITE | FaultCause::PRESENT);
        m.traps.handle_user_trap(&main, &mut fault);
        assert!(main.pending_signals().is_empty());
        assert!(!process.vm().is_cow(addr));
        assert_eq!(process.vm().read_word(addr), Ok(7));
    }

    // =========================================================================
    // Kernel faults
    // =========================================================================

    #[test]
    fn test_kernel_fault_in_kernel_map() {
        let m = machine();
        let base = KERNEL_BASE + 0x10_0000;
        m.kernel
            .kernel_space()
            .map_anonymous(VirtAddr::new(base), 4 * PAGE_SIZE, ProtectionFlags::RW)
            .unwrap();

        let mut frame = TrapFrame::page_fault(Privilege::Kernel, base + PAGE_SIZE, FaultCause::WRITE);
        m.traps
            .handle_kernel_trap(Some(m.kernel.thread0()), CpuId::BOOT, &mut frame);
        assert!(m
            .kernel
            .kernel_space()
            .write_word(VirtAddr::new(base + PAGE_SIZE), 1)
            .is_ok());
    }

    #[test]
    #[should_panic(expected = "no thread context")]
    fn test_kernel_fault_without_context_is_fatal() {
        let m = machine();
        let mut frame = TrapFrame::page_fault(Privilege::Kernel, KERNEL_BASE + 0x1000, FaultCause::empty());
        m.traps.handle_kernel_trap(None, CpuId::BOOT, &mut frame);
    }

    #[test]
    #[should_panic(expected = "invalid recovery point")]
    fn test_unregistered_recovery_point_is_fatal() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        main.set_onfault(0xdead_beef);
        let mut frame = TrapFrame::page_fault(Privilege::Kernel, 0x5000_0000, FaultCause::empty());
        m.traps.handle_kernel_trap(Some(&main), CpuId::BOOT, &mut frame);
    }

    #[test]
    fn test_armed_recovery_point_resumes() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        main.set_onfault(COPY_FAULT);

        let mut frame = TrapFrame::page_fault(Privilege::Kernel, 0x5000_0000, FaultCause::empty());
        frame.pc = KERNEL_BASE + 0x1234;
        let cpu = m.kernel.cpus().get(CpuId::BOOT);
        let outcome = m.traps.resolver().resolve_kernel_fault(Some(&main), cpu, &mut frame);
        assert!(matches!(outcome, KernelFault::Recovered(_)));
        assert_eq!(frame.pc, COPY_FAULT);
        assert_eq!(main.onfault(), COPY_FAULT);
    }

    #[test]
    #[should_panic(expected = "supervisor mode execution prevention")]
    fn test_smep_violation_is_fatal() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        let mut frame = TrapFrame::page_fault(Privilege::Kernel, TEXT, FaultCause::INSTRUCTION_FETCH);
        m.traps.handle_kernel_trap(Some(&main), CpuId::BOOT, &mut frame);
    }

    #[test]
    #[should_panic(expected = "supervisor mode access prevention")]
    fn test_smap_violation_is_fatal() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        let mut frame = TrapFrame::page_fault(Privilege::Kernel, STACK_TOP - 64, FaultCause::PRESENT);
        m.traps.handle_kernel_trap(Some(&main), CpuId::BOOT, &mut frame);
    }

    #[test]
    fn test_user_access_without_smap_resolves() {
        let m = machine_with(CpuFeatures::legacy(), TrapHooks::new());
        let (process, main) = spawn_user(&m.kernel);
        let addr = STACK_TOP - 2 * PAGE_SIZE;

        let mut frame = TrapFrame::page_fault(Privilege::Kernel, addr, FaultCause::WRITE);
        m.traps.handle_kernel_trap(Some(&main), CpuId::BOOT, &mut frame);
        assert!(process.vm().write_word(VirtAddr::new(addr), 3).is_ok());
    }

    #[test]
    fn test_atomic_context_does_not_fault_user_pages() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        let vm = process.vm();
        let faults = vm.fault_count();
        main.set_onfault(COPY_FAULT);

        let cpu = m.kernel.cpus().get(CpuId::BOOT);
        cpu.enter_atomic();
        let mut frame = TrapFrame::page_fault(Privilege::Kernel, STACK_TOP - PAGE_SIZE, FaultCause::WRITE);
        let outcome = m.traps.resolver().resolve_kernel_fault(Some(&main), cpu, &mut frame);
        cpu.exit_atomic();

        assert!(matches!(outcome, KernelFault::Recovered(_)));
        assert_eq!(vm.fault_count(), faults);
    }

    // =========================================================================
    // User copies
    // =========================================================================

    #[test]
    fn test_copy_round_trip_and_efault() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        let at = VirtAddr::new(STACK_TOP - 4 * PAGE_SIZE);

        m.traps.copyout(&main, at, &[1, 2, 3]).unwrap();
        let mut back = [0u64; 3];
        m.traps.copyin(&main, at, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3]);

        let mut buf = [0u64; 2];
        assert_eq!(
            m.traps.copyin(&main, VirtAddr::new(0x3000_0000), &mut buf),
            Err(SysError::Errno(EFAULT))
        );
        assert_eq!(
            m.traps.copyout(&main, VirtAddr::new(KERNEL_BASE), &buf),
            Err(SysError::Errno(EFAULT))
        );
        assert_eq!(
            m.traps.copyin(&main, VirtAddr::new(at.as_u64() + 4), &mut buf),
            Err(SysError::Errno(EFAULT))
        );
        assert_eq!(main.onfault(), 0);
    }

    // =========================================================================
    // Kernel traps
    // =========================================================================

    #[test]
    fn test_debugger_takes_kernel_breakpoint() {
        let debugger = Arc::new(CountingDebugger::default());
        let m = machine_with(CpuFeatures::full(), TrapHooks::new().with_debugger(debugger.clone()));

        let mut frame = TrapFrame::new(TrapKind::Breakpoint, Privilege::Kernel);
        m.traps.handle_kernel_trap(None, CpuId::BOOT, &mut frame);
        assert_eq!(debugger.entries.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "trap type 2")]
    fn test_unexpected_kernel_trap_is_fatal() {
        let m = machine();
        let mut frame = TrapFrame::new(TrapKind::Arithmetic, Privilege::Kernel);
        m.traps.handle_kernel_trap(None, CpuId::BOOT, &mut frame);
    }

    #[test]
    fn test_nmi_recovery() {
        let hooks = TrapHooks::new().with_nmi_recovery(Arc::new(AlwaysRecover));
        let m = machine_with(CpuFeatures::full(), hooks);
        let mut frame = TrapFrame::new(TrapKind::Nmi, Privilege::Kernel);
        m.traps.handle_kernel_trap(None, CpuId::BOOT, &mut frame);
        assert_eq!(m.traps.stats().traps, 1);
    }

    #[test]
    #[should_panic(expected = "NMI not recovered")]
    fn test_unrecovered_nmi_is_fatal() {
        let m = machine();
        let mut frame = TrapFrame::new(TrapKind::Nmi, Privilege::Kernel);
        m.traps.handle_kernel_trap(None, CpuId::BOOT, &mut frame);
    }

    // =========================================================================
    // AST and child return
    // =========================================================================

    #[test]
    fn test_ast_runs_deferred_work() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        process.start_profiling(0x8000);
        main.set_flag(ThreadFlags::OWEUPC);
        m.kernel.cpus().get(CpuId::BOOT).request_resched();
        process.set_cred(Credentials::user(5, 5));

        let mut frame = TrapFrame::new(TrapKind::Ast, Privilege::User);
        m.traps.handle_ast(&main, CpuId::BOOT, &mut frame);

        assert_eq!(main.prof_ticks(), 1);
        assert!(!main.has_flag(ThreadFlags::OWEUPC));
        assert!(!m.kernel.cpus().get(CpuId::BOOT).resched_pending());
        assert_eq!(m.scheduler.metrics().preemptions, 1);
        assert_eq!(main.cred().ruid, 5);
        assert_eq!(m.traps.stats().softs, 1);
    }

    #[test]
    fn test_ast_without_profiling_drops_the_tick() {
        let m = machine();
        let (_, main) = spawn_user(&m.kernel);
        main.set_flag(ThreadFlags::OWEUPC);

        let mut frame = TrapFrame::new(TrapKind::Ast, Privilege::User);
        m.traps.handle_ast(&main, CpuId::BOOT, &mut frame);
        assert_eq!(main.prof_ticks(), 0);
        assert!(!main.has_flag(ThreadFlags::OWEUPC));
        assert_eq!(m.scheduler.metrics().preemptions, 0);
    }

    #[test]
    fn test_ast_consumes_only_the_running_cpus_request() {
        let m = smp_machine(2, CpuFeatures::full(), TrapHooks::new());
        let (_, main) = spawn_user(&m.kernel);
        let other = CpuId(1);
        main.set_cpu(other);
        m.kernel.cpus().get(other).request_resched();

        // Queued for CPU 1 but returning to user on CPU 0.
        let mut frame = TrapFrame::new(TrapKind::Ast, Privilege::User);
        m.traps.handle_ast(&main, CpuId::BOOT, &mut frame);
        assert!(m.kernel.cpus().get(other).resched_pending());
        assert_eq!(m.scheduler.metrics().preemptions, 0);

        let mut frame = TrapFrame::new(TrapKind::Ast, Privilege::User);
        m.traps.handle_ast(&main, other, &mut frame);
        assert!(!m.kernel.cpus().get(other).resched_pending());
        assert_eq!(m.scheduler.metrics().preemptions, 1);
    }

    #[test]
    #[should_panic(expected = "not returning to user mode")]
    fn test_ast_from_kernel_mode_is_fatal() {
        let m = machine();
        let mut frame = TrapFrame::new(TrapKind::Ast, Privilege::Kernel);
        m.traps.handle_ast(m.kernel.thread0(), CpuId::BOOT, &mut frame);
    }

    #[test]
    fn test_traced_child_reports_fork() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        process.set_flag(ProcessFlags::TRACED);

        let pid = m
            .kernel
            .fork1(&main, ForkFlags::FORK | ForkFlags::PTRACE, ThreadEntry::ChildReturn)
            .unwrap();
        let child = m.kernel.registry().find_process(pid).unwrap();
        let child_main = Arc::clone(child.main_thread());

        m.traps.child_return(&child_main);
        assert_eq!(signals(&child_main), [Signal::SIGTRAP]);
        assert_eq!(signals(&main), [Signal::SIGTRAP]);
    }

    #[test]
    fn test_fork_reports_follow_the_trace_mask() {
        let m = machine();
        let (process, main) = spawn_user(&m.kernel);
        process.set_flag(ProcessFlags::TRACED);

        let mut frame = user_syscall(SYS_FORK, &[]);
        m.traps.handle_syscall(&main, &mut frame);
        let quiet = m
            .kernel
            .registry()
            .find_process(kestrel_execution::ProcessId::new(frame.ret0() as u32))
            .unwrap();
        assert!(!quiet.has_flag(ProcessFlags::TRACED));
        assert!(main.pending_signals().is_empty());

        process.set_trace_mask(TraceMask::FORK);
        let mut frame = user_syscall(SYS_FORK, &[]);
        m.traps.handle_syscall(&main, &mut frame);
        assert!(!carry(&frame));
        let child = m
            .kernel
            .registry()
            .find_process(kestrel_execution::ProcessId::new(frame.ret0() as u32))
            .unwrap();
        assert!(child.has_flag(ProcessFlags::TRACED));
        assert_eq!(child.trace_state().unwrap().report_event, Some(TraceEvent::Fork));
        assert_eq!(child.trace_state().unwrap().other_pid, Some(process.pid()));

        let child_main = Arc::clone(child.main_thread());
        m.traps.child_return(&child_main);
        assert_eq!(signals(&child_main), [Signal::SIGTRAP]);
        assert_eq!(signals(&main), [Signal::SIGTRAP]);
    }
}
