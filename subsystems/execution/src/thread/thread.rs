//! # Thread Structure
//!
//! Core thread data structure.
//!
//! A new thread copies a fixed set of fields from its parent (signal mask,
//! priority) and starts every other per-thread field from zero. The owning
//! process is a weak back-reference; the process owns its threads.

use super::ThreadState;
use crate::cred::Credentials;
use crate::fork::ThreadEntry;
use crate::process::Process;
use crate::scheduler::Priority;
use crate::signal::{SigInfo, SigSet};
use crate::{ExecError, ExecResult, ThreadId};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kestrel_hal::{CpuId, Privilege, TrapFrame, TrapKind, PAGE_SIZE};
use kestrel_memory::{FrameLease, FramePool};
use spin::{Mutex, RwLock};

/// Thread flags
pub mod flags {
    use bitflags::bitflags;

    bitflags! {
        /// Thread flags
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ThreadFlags: u32 {
            /// Kernel thread; never returns to user mode
            const SYSTEM = 1 << 0;
            /// Not the main thread of its process
            const THREAD = 1 << 1;
            /// Must stop for a single-threading request
            const SUSPSINGLE = 1 << 2;
            /// A profiling tick is owed at the next AST
            const OWEUPC = 1 << 3;
            /// Sleeping interruptibly
            const SINTR = 1 << 4;
        }
    }
}

pub use flags::ThreadFlags;

/// Kernel stack (u-area) of a thread
#[derive(Debug)]
pub struct KernelStack {
    frames: FrameLease,
}

impl KernelStack {
    /// Take `pages` frames for a kernel stack
    pub fn allocate(pool: &Arc<FramePool>, pages: u64) -> ExecResult<Self> {
        pool.lease(pages)
            .map(|frames| Self { frames })
            .map_err(|_| ExecError::OutOfMemory)
    }

    /// Stack size in bytes
    pub fn size(&self) -> u64 {
        self.frames.frames() * PAGE_SIZE
    }
}

/// Per-thread sleep timeout
#[derive(Debug, Default)]
pub struct SleepTimer {
    armed: AtomicBool,
    deadline: AtomicU64,
}

impl SleepTimer {
    /// Disarmed timer
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            deadline: AtomicU64::new(0),
        }
    }

    /// Arm for `deadline` ticks
    pub fn arm(&self, deadline: u64) {
        self.deadline.store(deadline, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    /// Disarm
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Is it armed?
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// Thread structure
#[derive(Debug)]
pub struct Thread {
    /// Unique identifier, 0 until registered
    tid: AtomicU32,
    /// Current state
    state: AtomicU32,
    /// Flags
    flags: RwLock<ThreadFlags>,

    // Copied from the parent thread.
    /// Blocked signals
    sigmask: AtomicU32,
    /// User priority
    priority: RwLock<Priority>,

    // Zeroed for every new thread.
    /// Signals posted to this thread
    pending: Mutex<Vec<SigInfo>>,
    /// Sleep timeout
    sleep_timer: SleepTimer,
    /// Armed recovery address for user copies (0 = none)
    onfault: AtomicU64,
    /// Profiling ticks charged
    prof_ticks: AtomicU64,

    /// Credential reference
    cred: RwLock<Arc<Credentials>>,
    /// Kernel stack
    kstack: KernelStack,
    /// Saved user context
    frame: Mutex<TrapFrame>,
    /// Where the thread starts when first scheduled
    entry: Mutex<ThreadEntry>,
    /// Thread control block (TLS base)
    tcb: AtomicU64,
    /// Owning process
    process: RwLock<Weak<Process>>,
    /// CPU the thread is assigned to
    cpu: RwLock<Option<CpuId>>,
}

impl Thread {
    fn with_parts(
        kstack: KernelStack,
        cred: Arc<Credentials>,
        sigmask: SigSet,
        priority: Priority,
        frame: TrapFrame,
    ) -> Self {
        Self {
            tid: AtomicU32::new(0),
            state: AtomicU32::new(ThreadState::Embryonic.as_u32()),
            flags: RwLock::new(ThreadFlags::empty()),
            sigmask: AtomicU32::new(sigmask.bits()),
            priority: RwLock::new(priority),
            pending: Mutex::new(Vec::new()),
            sleep_timer: SleepTimer::new(),
            onfault: AtomicU64::new(0),
            prof_ticks: AtomicU64::new(0),
            cred: RwLock::new(cred),
            kstack,
            frame: Mutex::new(frame),
            entry: Mutex::new(ThreadEntry::ChildReturn),
            tcb: AtomicU64::new(0),
            process: RwLock::new(Weak::new()),
            cpu: RwLock::new(None),
        }
    }

    /// Build the first thread of the system
    pub fn bootstrap(kstack: KernelStack, cred: Arc<Credentials>) -> Self {
        Self::with_parts(
            kstack,
            cred,
            SigSet::EMPTY,
            Priority::DEFAULT,
            TrapFrame::new(TrapKind::Ast, Privilege::Kernel),
        )
    }

    /// Build a new embryonic thread from `parent`
    ///
    /// The signal mask and priority are copied as they are at the time of
    /// the call, the credential reference is taken from the parent and the
    /// sleep timer starts disarmed. The saved context is filled in later.
    pub fn fork_from(parent: &Thread, kstack: KernelStack) -> Self {
        Self::with_parts(
            kstack,
            parent.cred(),
            parent.sigmask(),
            parent.priority(),
            TrapFrame::new(TrapKind::Ast, Privilege::User),
        )
    }

    /// Get thread ID
    pub fn tid(&self) -> ThreadId {
        ThreadId::new(self.tid.load(Ordering::Acquire))
    }

    pub(crate) fn set_tid(&self, tid: ThreadId) {
        self.tid.store(tid.as_u32(), Ordering::Release);
    }

    /// Get current state
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::SeqCst)).unwrap_or(ThreadState::Zombie)
    }

    /// Set thread state
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state.as_u32(), Ordering::SeqCst);
    }

    /// Get flags
    pub fn flags(&self) -> ThreadFlags {
        *self.flags.read()
    }

    /// Set a flag
    pub fn set_flag(&self, flag: ThreadFlags) {
        self.flags.write().insert(flag);
    }

    /// Clear a flag
    pub fn clear_flag(&self, flag: ThreadFlags) {
        self.flags.write().remove(flag);
    }

    /// Check a flag
    pub fn has_flag(&self, flag: ThreadFlags) -> bool {
        self.flags.read().contains(flag)
    }

    /// Clear a flag, returning whether it was set
    pub fn take_flag(&self, flag: ThreadFlags) -> bool {
        let mut flags = self.flags.write();
        let was = flags.contains(flag);
        flags.remove(flag);
        was
    }

    /// Blocked signals
    pub fn sigmask(&self) -> SigSet {
        SigSet::from_bits(self.sigmask.load(Ordering::Relaxed))
    }

    /// Replace the signal mask
    pub fn set_sigmask(&self, mask: SigSet) {
        self.sigmask.store(mask.bits(), Ordering::Relaxed);
    }

    /// Get priority
    pub fn priority(&self) -> Priority {
        *self.priority.read()
    }

    /// Set priority
    pub fn set_priority(&self, priority: Priority) {
        *self.priority.write() = priority;
    }

    /// Credential reference
    pub fn cred(&self) -> Arc<Credentials> {
        Arc::clone(&self.cred.read())
    }

    /// Replace the credential reference
    pub fn set_cred(&self, cred: Arc<Credentials>) {
        *self.cred.write() = cred;
    }

    /// Pick up the process credentials if they were replaced
    ///
    /// Returns true when the reference changed.
    pub fn refresh_cred(&self, process_cred: &Arc<Credentials>) -> bool {
        let mut cred = self.cred.write();
        if Arc::ptr_eq(&cred, process_cred) {
            return false;
        }
        *cred = Arc::clone(process_cred);
        true
    }

    /// Kernel stack
    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kstack
    }

    /// Sleep timeout
    pub fn sleep_timer(&self) -> &SleepTimer {
        &self.sleep_timer
    }

    /// Saved user context (copy)
    pub fn frame(&self) -> TrapFrame {
        self.frame.lock().clone()
    }

    /// Save the user context
    pub fn save_frame(&self, frame: &TrapFrame) {
        self.frame.lock().clone_from(frame);
    }

    /// Start function
    pub fn entry(&self) -> ThreadEntry {
        *self.entry.lock()
    }

    pub(crate) fn set_entry(&self, entry: ThreadEntry) {
        *self.entry.lock() = entry;
    }

    /// Thread control block
    pub fn tcb(&self) -> u64 {
        self.tcb.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tcb(&self, tcb: u64) {
        self.tcb.store(tcb, Ordering::Relaxed);
    }

    /// Owning process
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.read().upgrade()
    }

    pub(crate) fn set_process(&self, process: &Arc<Process>) {
        *self.process.write() = Arc::downgrade(process);
    }

    /// Assigned CPU
    pub fn cpu(&self) -> Option<CpuId> {
        *self.cpu.read()
    }

    /// Assign a CPU
    pub fn set_cpu(&self, cpu: CpuId) {
        *self.cpu.write() = Some(cpu);
    }

    /// Armed recovery address (0 = none)
    pub fn onfault(&self) -> u64 {
        self.onfault.load(Ordering::Acquire)
    }

    /// Arm or clear the recovery address
    pub fn set_onfault(&self, addr: u64) {
        self.onfault.store(addr, Ordering::Release);
    }

    /// Queue a signal on this thread
    pub fn post_signal(&self, info: SigInfo) {
        self.pending.lock().push(info);
    }

    /// Signals posted so far
    pub fn pending_signals(&self) -> Vec<SigInfo> {
        self.pending.lock().clone()
    }

    /// Remove and return posted signals
    pub fn take_pending_signals(&self) -> Vec<SigInfo> {
        core::mem::take(&mut *self.pending.lock())
    }

    /// Charge one profiling tick
    pub fn charge_prof_tick(&self) {
        self.prof_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Profiling ticks charged
    pub fn prof_ticks(&self) -> u64 {
        self.prof_ticks.load(Ordering::Relaxed)
    }
}
