//! # Process Management
//!
//! A process owns resources: an address space, a descriptor table, a
//! signal action table, credentials and resource limits. Each of the shared
//! pieces is an `Arc`; sharing clones the handle, copying builds a new
//! structure seeded from the parent.
//!
//! A process owns its threads. Threads point back with a `Weak`.

use crate::cred::Credentials;
use crate::files::FileTable;
use crate::fork::ForkFlags;
use crate::limits::Limits;
use crate::signal::SigActs;
use crate::thread::{Thread, ThreadFlags};
use crate::{ProcessId, ThreadId};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kestrel_memory::AddressSpace;
use spin::{Mutex, RwLock};

/// Process flags
pub mod flags {
    use bitflags::bitflags;

    bitflags! {
        /// Process flags
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ProcessFlags: u32 {
            /// Has a controlling terminal
            const CONTROLT = 1 << 0;
            /// Has exec'd
            const EXEC = 1 << 1;
            /// Had set id privileges since last exec
            const SUGID = 1 << 2;
            /// Exec'd a set id image
            const SUGIDEXEC = 1 << 3;
            /// Parent is waiting for exec or exit
            const PPWAIT = 1 << 4;
            /// Waiting for a vfork child to exec or exit
            const ISPWAIT = 1 << 5;
            /// Has started profiling
            const PROFIL = 1 << 6;
            /// Being traced
            const TRACED = 1 << 7;
            /// Exited, waiting to be reaped
            const ZOMBIE = 1 << 8;
            /// Chroot'ed
            const CHROOT = 1 << 9;
            /// No zombie; the parent will not wait
            const NOZOMBIE = 1 << 10;
            /// Kernel process
            const SYSTEM = 1 << 11;
            /// Still being constructed
            const EMBRYO = 1 << 12;
            /// Has called pledge
            const PLEDGE = 1 << 13;
            /// Pledge for the next exec
            const EXECPLEDGE = 1 << 14;
            /// May create writable and executable mappings
            const WXNEEDED = 1 << 15;

            /// Flags a child always inherits
            const INHERITED = Self::SUGID.bits()
                | Self::SUGIDEXEC.bits()
                | Self::PLEDGE.bits()
                | Self::EXECPLEDGE.bits()
                | Self::WXNEEDED.bits()
                | Self::CHROOT.bits();
        }
    }

    bitflags! {
        /// Events a debugger asked to have reported
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct TraceMask: u32 {
            /// fork(2), with the child traced too
            const FORK = 1 << 1;
        }
    }
}

pub use flags::{ProcessFlags, TraceMask};

/// Login session
#[derive(Debug)]
pub struct Session {
    sid: ProcessId,
    has_tty: AtomicBool,
}

impl Session {
    /// New session led by `sid`
    pub fn new(sid: ProcessId, has_tty: bool) -> Arc<Self> {
        Arc::new(Self {
            sid,
            has_tty: AtomicBool::new(has_tty),
        })
    }

    /// Session id
    pub fn sid(&self) -> ProcessId {
        self.sid
    }

    /// Does the session have a controlling terminal?
    pub fn has_tty(&self) -> bool {
        self.has_tty.load(Ordering::Acquire)
    }

    /// Attach or detach the controlling terminal
    pub fn set_tty(&self, has_tty: bool) {
        self.has_tty.store(has_tty, Ordering::Release);
    }
}

/// Event a traced process reports to its debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// The process forked
    Fork,
}

/// Debugger bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceState {
    /// Pending report
    pub report_event: Option<TraceEvent>,
    /// The other side of a fork report
    pub other_pid: Option<ProcessId>,
}

/// Accounting flag: forked but did not exec
pub const AFORK: u32 = 0x1;

/// Process structure
#[derive(Debug)]
pub struct Process {
    pid: ProcessId,
    flags: RwLock<ProcessFlags>,
    name: RwLock<String>,
    /// Uid the process slot is charged to
    charged_uid: AtomicU32,

    parent: RwLock<Weak<Process>>,
    /// Original parent while traced
    oppid: AtomicU32,
    children: RwLock<Vec<Arc<Process>>>,
    pgid: ProcessId,
    session: Arc<Session>,

    threads: RwLock<Vec<Arc<Thread>>>,
    main_thread: Arc<Thread>,
    refcnt: AtomicU32,

    vm: RwLock<Arc<AddressSpace>>,
    files: Arc<FileTable>,
    sigacts: Arc<SigActs>,
    cred: RwLock<Arc<Credentials>>,
    limits: Arc<Limits>,

    start_ticks: AtomicU64,
    acflag: AtomicU32,
    prof_base: AtomicU64,
    trace: Mutex<Option<TraceState>>,
    ptmask: AtomicU32,

    /// Thread a single-threading request is for
    single: Mutex<Option<ThreadId>>,
    /// Threads that still have to stop for it
    singlecnt: AtomicU32,
}

impl Process {
    /// Build process 0 around its first thread
    pub fn bootstrap(
        main: Arc<Thread>,
        vm: Arc<AddressSpace>,
        cred: Arc<Credentials>,
        limits: Arc<Limits>,
    ) -> Arc<Self> {
        let process = Arc::new(Self {
            pid: ProcessId::SWAPPER,
            flags: RwLock::new(ProcessFlags::SYSTEM),
            name: RwLock::new(String::from("swapper")),
            charged_uid: AtomicU32::new(0),
            parent: RwLock::new(Weak::new()),
            oppid: AtomicU32::new(0),
            children: RwLock::new(Vec::new()),
            pgid: ProcessId::SWAPPER,
            session: Session::new(ProcessId::SWAPPER, false),
            threads: RwLock::new(alloc::vec![Arc::clone(&main)]),
            main_thread: Arc::clone(&main),
            refcnt: AtomicU32::new(1),
            vm: RwLock::new(vm),
            files: Arc::new(FileTable::new()),
            sigacts: Arc::new(SigActs::new()),
            cred: RwLock::new(cred),
            limits,
            start_ticks: AtomicU64::new(0),
            acflag: AtomicU32::new(0),
            prof_base: AtomicU64::new(0),
            trace: Mutex::new(None),
            ptmask: AtomicU32::new(0),
            single: Mutex::new(None),
            singlecnt: AtomicU32::new(0),
        });
        main.set_process(&process);
        process
    }

    /// Build a new embryonic process for `main`, forked from `parent`
    ///
    /// The child takes a fixed subset of the parent's flags, shares or
    /// copies each of the descriptor table, signal actions and address
    /// space per `mode`, and starts with `main` as its only thread. It is
    /// still marked `EMBRYO` and must be published before anything else can
    /// see it.
    pub fn fork_from(
        pid: ProcessId,
        parent: &Arc<Process>,
        main: &Arc<Thread>,
        mode: ForkFlags,
    ) -> Arc<Self> {
        let pflags = parent.flags();
        let mut flags = (pflags & ProcessFlags::INHERITED) | ProcessFlags::EMBRYO;
        if parent.session.has_tty() {
            flags |= pflags & ProcessFlags::CONTROLT;
        }
        let mut ptmask = TraceMask::empty();
        if mode.contains(ForkFlags::PTRACE) && pflags.contains(ProcessFlags::TRACED) {
            flags |= ProcessFlags::TRACED;
            ptmask = parent.trace_mask();
        }
        if mode.contains(ForkFlags::NOZOMBIE) {
            flags |= ProcessFlags::NOZOMBIE;
        }
        if mode.contains(ForkFlags::SYSTEM) {
            flags |= ProcessFlags::SYSTEM;
        }
        if pflags.contains(ProcessFlags::PROFIL) {
            flags |= ProcessFlags::PROFIL;
        }

        let files = if mode.contains(ForkFlags::SHARE_FILES) {
            Arc::clone(&parent.files)
        } else {
            Arc::new(parent.files.copy())
        };
        let sigacts = if mode.contains(ForkFlags::SHARE_SIGHAND) {
            Arc::clone(&parent.sigacts)
        } else {
            Arc::new(parent.sigacts.copy())
        };
        let parent_vm = parent.vm();
        let vm = if mode.contains(ForkFlags::SHARE_VM) {
            parent_vm
        } else {
            Arc::new(parent_vm.duplicate_for_fork())
        };

        let process = Arc::new(Self {
            pid,
            flags: RwLock::new(flags),
            name: RwLock::new(parent.name()),
            charged_uid: AtomicU32::new(0),
            parent: RwLock::new(Arc::downgrade(parent)),
            oppid: AtomicU32::new(0),
            children: RwLock::new(Vec::new()),
            pgid: parent.pgid,
            session: Arc::clone(&parent.session),
            threads: RwLock::new(alloc::vec![Arc::clone(main)]),
            main_thread: Arc::clone(main),
            refcnt: AtomicU32::new(1),
            vm: RwLock::new(vm),
            files,
            sigacts,
            cred: RwLock::new(parent.cred()),
            limits: Arc::clone(&parent.limits),
            start_ticks: AtomicU64::new(0),
            acflag: AtomicU32::new(0),
            prof_base: AtomicU64::new(parent.prof_base.load(Ordering::Relaxed)),
            trace: Mutex::new(None),
            ptmask: AtomicU32::new(ptmask.bits()),
            single: Mutex::new(None),
            singlecnt: AtomicU32::new(0),
        });
        main.set_process(&process);
        process
    }

    /// Get process ID
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Command name
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Rename the process
    pub fn set_name(&self, name: &str) {
        *self.name.write() = String::from(name);
    }

    /// Uid the process slot is charged to
    pub fn charged_uid(&self) -> u32 {
        self.charged_uid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_charged_uid(&self, uid: u32) {
        self.charged_uid.store(uid, Ordering::Relaxed);
    }

    /// Get flags
    pub fn flags(&self) -> ProcessFlags {
        *self.flags.read()
    }

    /// Set a flag
    pub fn set_flag(&self, flag: ProcessFlags) {
        self.flags.write().insert(flag);
    }

    /// Clear a flag
    pub fn clear_flag(&self, flag: ProcessFlags) {
        self.flags.write().remove(flag);
    }

    /// Check a flag
    pub fn has_flag(&self, flag: ProcessFlags) -> bool {
        self.flags.read().contains(flag)
    }

    /// Still being constructed?
    pub fn is_embryo(&self) -> bool {
        self.has_flag(ProcessFlags::EMBRYO)
    }

    /// Parent process
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.read().upgrade()
    }

    /// Parent pid, 0 when orphaned
    pub fn ppid(&self) -> ProcessId {
        self.parent().map(|p| p.pid).unwrap_or(ProcessId::SWAPPER)
    }

    /// Move `child` under `self`
    pub fn adopt(self: &Arc<Self>, child: &Arc<Process>) {
        if let Some(old) = child.parent() {
            old.remove_child(child.pid);
        }
        *child.parent.write() = Arc::downgrade(self);
        self.add_child(child);
    }

    /// Original parent while traced
    pub fn oppid(&self) -> ProcessId {
        ProcessId::new(self.oppid.load(Ordering::Relaxed))
    }

    /// Remember the original parent
    pub fn set_oppid(&self, pid: ProcessId) {
        self.oppid.store(pid.as_u32(), Ordering::Relaxed);
    }

    /// Child processes
    pub fn children(&self) -> Vec<Arc<Process>> {
        self.children.read().clone()
    }

    /// Link a child
    pub fn add_child(&self, child: &Arc<Process>) {
        self.children.write().push(Arc::clone(child));
    }

    /// Unlink a child
    pub fn remove_child(&self, pid: ProcessId) -> Option<Arc<Process>> {
        let mut children = self.children.write();
        let pos = children.iter().position(|c| c.pid == pid)?;
        Some(children.remove(pos))
    }

    /// Process group
    pub fn pgid(&self) -> ProcessId {
        self.pgid
    }

    /// Session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Live threads, main thread first
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.read().clone()
    }

    /// Number of live threads
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// The main thread
    pub fn main_thread(&self) -> &Arc<Thread> {
        &self.main_thread
    }

    /// Append a thread and take a reference for it
    ///
    /// A thread attached while a single-threading request is pending is
    /// flagged and counted with the others. Returns whether it was.
    pub fn attach_thread(&self, thread: &Arc<Thread>) -> bool {
        let single = self.single.lock();
        self.threads.write().push(Arc::clone(thread));
        self.refcnt.fetch_add(1, Ordering::AcqRel);
        if single.is_none() {
            return false;
        }
        thread.set_flag(ThreadFlags::SUSPSINGLE);
        self.singlecnt.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Drop an exited thread and its reference
    pub fn remove_thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        let mut threads = self.threads.write();
        let pos = threads.iter().position(|t| t.tid() == tid)?;
        self.refcnt.fetch_sub(1, Ordering::AcqRel);
        Some(threads.remove(pos))
    }

    /// References held by threads
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Address space
    pub fn vm(&self) -> Arc<AddressSpace> {
        Arc::clone(&self.vm.read())
    }

    /// Install a new address space (exec)
    pub fn replace_vm(&self, vm: Arc<AddressSpace>) -> Arc<AddressSpace> {
        core::mem::replace(&mut *self.vm.write(), vm)
    }

    /// Descriptor table
    pub fn files(&self) -> &Arc<FileTable> {
        &self.files
    }

    /// Signal actions
    pub fn sigacts(&self) -> &Arc<SigActs> {
        &self.sigacts
    }

    /// Credentials
    pub fn cred(&self) -> Arc<Credentials> {
        Arc::clone(&self.cred.read())
    }

    /// Replace the credentials (threads pick them up at their next AST)
    pub fn set_cred(&self, cred: Arc<Credentials>) {
        *self.cred.write() = cred;
    }

    /// Resource limits
    pub fn limits(&self) -> &Arc<Limits> {
        &self.limits
    }

    /// Creation time in ticks
    pub fn start_ticks(&self) -> u64 {
        self.start_ticks.load(Ordering::Relaxed)
    }

    /// Stamp the creation time
    pub fn set_start_ticks(&self, ticks: u64) {
        self.start_ticks.store(ticks, Ordering::Relaxed);
    }

    /// Accounting flags
    pub fn acflag(&self) -> u32 {
        self.acflag.load(Ordering::Relaxed)
    }

    /// Set accounting flags
    pub fn set_acflag(&self, flag: u32) {
        self.acflag.fetch_or(flag, Ordering::Relaxed);
    }

    /// Start profiling into the buffer at `base`
    pub fn start_profiling(&self, base: u64) {
        self.prof_base.store(base, Ordering::Relaxed);
        self.set_flag(ProcessFlags::PROFIL);
    }

    /// Profiling buffer
    pub fn prof_base(&self) -> Option<u64> {
        if self.has_flag(ProcessFlags::PROFIL) {
            Some(self.prof_base.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Debugger bookkeeping
    pub fn trace_state(&self) -> Option<TraceState> {
        *self.trace.lock()
    }

    /// Replace the debugger bookkeeping
    pub fn set_trace_state(&self, state: Option<TraceState>) {
        *self.trace.lock() = state;
    }

    /// Events the debugger wants reported
    pub fn trace_mask(&self) -> TraceMask {
        TraceMask::from_bits_truncate(self.ptmask.load(Ordering::Relaxed))
    }

    /// Replace the reported events
    pub fn set_trace_mask(&self, mask: TraceMask) {
        self.ptmask.store(mask.bits(), Ordering::Relaxed);
    }

    /// Ask every thread but `keeper` to stop
    ///
    /// Holds the request lock across the walk so that [`attach_thread`]
    /// sees either none of it or all of it.
    ///
    /// [`attach_thread`]: Process::attach_thread
    pub fn begin_single_threading(&self, keeper: ThreadId) {
        let mut single = self.single.lock();
        *single = Some(keeper);
        let mut count = 0;
        for thread in self.threads.read().iter().filter(|t| t.tid() != keeper) {
            thread.set_flag(ThreadFlags::SUSPSINGLE);
            count += 1;
        }
        self.singlecnt.store(count, Ordering::Release);
    }

    /// Withdraw the single-threading request
    pub fn end_single_threading(&self) {
        let mut single = self.single.lock();
        *single = None;
        for thread in self.threads.read().iter() {
            thread.clear_flag(ThreadFlags::SUSPSINGLE);
        }
        self.singlecnt.store(0, Ordering::Release);
    }

    /// Thread a single-threading request is for
    pub fn single_threading(&self) -> Option<ThreadId> {
        *self.single.lock()
    }

    /// Threads that still have to stop
    pub fn single_count(&self) -> u32 {
        self.singlecnt.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::OpenFile;
    use crate::signal::{Disposition, Signal};
    use crate::thread::KernelStack;
    use kestrel_hal::VirtAddr;
    use kestrel_memory::{FramePool, ProtectionFlags};

    fn thread(pool: &Arc<FramePool>) -> Arc<Thread> {
        Arc::new(Thread::bootstrap(
            KernelStack::allocate(pool, 1).unwrap(),
            Credentials::root(),
        ))
    }

    fn proc0(pool: &Arc<FramePool>) -> Arc<Process> {
        let vm = Arc::new(AddressSpace::new_user(Arc::clone(pool)));
        Process::bootstrap(thread(pool), vm, Credentials::root(), Arc::new(Limits::default()))
    }

    #[test]
    fn test_fork_from_copies_by_default() {
        let pool = Arc::new(FramePool::new(64));
        let parent = proc0(&pool);
        parent.files().install(OpenFile::new("/etc/motd"));
        parent.sigacts().set(Signal::SIGCHLD, Disposition::Ignore);
        parent
            .vm()
            .map_anonymous(VirtAddr::new(0x1000_0000), 0x2000, ProtectionFlags::RW)
            .unwrap();
        parent.set_flag(ProcessFlags::SUGID | ProcessFlags::TRACED);

        let main = thread(&pool);
        let child = Process::fork_from(ProcessId::new(5), &parent, &main, ForkFlags::FORK);

        assert!(child.is_embryo());
        assert!(child.has_flag(ProcessFlags::SUGID));
        assert!(!child.has_flag(ProcessFlags::TRACED));
        assert!(!Arc::ptr_eq(child.files(), parent.files()));
        assert_eq!(child.files().open_count(), 1);
        assert!(!Arc::ptr_eq(&child.vm(), &parent.vm()));
        assert!(child.vm().find_region(VirtAddr::new(0x1000_0000)).is_some());
        child.sigacts().set(Signal::SIGCHLD, Disposition::Default);
        assert_eq!(parent.sigacts().get(Signal::SIGCHLD), Disposition::Ignore);
        assert!(Arc::ptr_eq(child.limits(), parent.limits()));
        assert!(Arc::ptr_eq(&main.process().unwrap(), &child));
        assert_eq!(child.ppid(), ProcessId::SWAPPER);
        assert_eq!(child.thread_count(), 1);
    }

    #[test]
    fn test_fork_from_shares_on_request() {
        let pool = Arc::new(FramePool::new(64));
        let parent = proc0(&pool);
        parent.set_flag(ProcessFlags::TRACED);
        let mode = ForkFlags::SHARE_FILES
            | ForkFlags::SHARE_SIGHAND
            | ForkFlags::SHARE_VM
            | ForkFlags::PTRACE
            | ForkFlags::NOZOMBIE;
        let child = Process::fork_from(ProcessId::new(6), &parent, &thread(&pool), mode);
        assert!(Arc::ptr_eq(child.files(), parent.files()));
        assert!(Arc::ptr_eq(child.sigacts(), parent.sigacts()));
        assert!(Arc::ptr_eq(&child.vm(), &parent.vm()));
        assert!(child.has_flag(ProcessFlags::TRACED));
        assert!(child.has_flag(ProcessFlags::NOZOMBIE));
        assert!(!child.has_flag(ProcessFlags::SYSTEM));
    }

    #[test]
    fn test_trace_mask_follows_traced_child() {
        let pool = Arc::new(FramePool::new(64));
        let parent = proc0(&pool);
        parent.set_flag(ProcessFlags::TRACED);
        parent.set_trace_mask(TraceMask::FORK);

        let traced = Process::fork_from(ProcessId::new(10), &parent, &thread(&pool), ForkFlags::PTRACE);
        assert!(traced.has_flag(ProcessFlags::TRACED));
        assert_eq!(traced.trace_mask(), TraceMask::FORK);

        let plain = Process::fork_from(ProcessId::new(11), &parent, &thread(&pool), ForkFlags::FORK);
        assert!(!plain.has_flag(ProcessFlags::TRACED));
        assert!(plain.trace_mask().is_empty());
    }

    #[test]
    fn test_controlling_terminal_needs_tty() {
        let pool = Arc::new(FramePool::new(64));
        let parent = proc0(&pool);
        parent.set_flag(ProcessFlags::CONTROLT);
        let child = Process::fork_from(ProcessId::new(7), &parent, &thread(&pool), ForkFlags::FORK);
        assert!(!child.has_flag(ProcessFlags::CONTROLT));

        parent.session().set_tty(true);
        let child = Process::fork_from(ProcessId::new(8), &parent, &thread(&pool), ForkFlags::FORK);
        assert!(child.has_flag(ProcessFlags::CONTROLT));
    }

    #[test]
    fn test_profiling_is_inherited() {
        let pool = Arc::new(FramePool::new(64));
        let parent = proc0(&pool);
        parent.start_profiling(0x4000);
        let child = Process::fork_from(ProcessId::new(9), &parent, &thread(&pool), ForkFlags::FORK);
        assert_eq!(child.prof_base(), Some(0x4000));
    }

    #[test]
    fn test_single_threading() {
        let pool = Arc::new(FramePool::new(64));
        let p = proc0(&pool);
        let keeper = p.main_thread().tid();
        let other = thread(&pool);
        other.set_tid(ThreadId::new(42));
        assert!(!p.attach_thread(&other));

        p.begin_single_threading(keeper);
        assert_eq!(p.single_count(), 1);
        assert!(other.has_flag(ThreadFlags::SUSPSINGLE));
        assert!(!p.main_thread().has_flag(ThreadFlags::SUSPSINGLE));

        let late = thread(&pool);
        late.set_tid(ThreadId::new(43));
        assert!(p.attach_thread(&late));
        assert!(late.has_flag(ThreadFlags::SUSPSINGLE));
        assert_eq!(p.single_count(), 2);

        p.end_single_threading();
        assert!(!other.has_flag(ThreadFlags::SUSPSINGLE));
        assert!(!late.has_flag(ThreadFlags::SUSPSINGLE));
        assert!(!p.attach_thread(&thread(&pool)));
        assert_eq!(p.single_count(), 0);
    }

    #[test]
    fn test_attach_then_begin_counts_once() {
        let pool = Arc::new(FramePool::new(64));
        let p = proc0(&pool);
        let keeper = p.main_thread().tid();
        let first = thread(&pool);
        first.set_tid(ThreadId::new(42));
        p.attach_thread(&first);

        // A thread attached just before the request is counted by the walk
        // alone.
        let new = thread(&pool);
        new.set_tid(ThreadId::new(43));
        assert!(!p.attach_thread(&new));
        p.begin_single_threading(keeper);

        assert_eq!(p.single_count(), 2);
        assert_eq!(p.thread_count(), 3);
        assert!(new.has_flag(ThreadFlags::SUSPSINGLE));
        assert_eq!(p.refcnt(), 3);
    }

    #[test]
    fn test_concurrent_attach_and_begin() {
        extern crate std;
        use std::thread as os;

        let pool = Arc::new(FramePool::new(256));
        let p = proc0(&pool);
        let keeper = p.main_thread().tid();
        let late: Vec<Arc<Thread>> = (0..32u32)
            .map(|i| {
                let t = thread(&pool);
                t.set_tid(ThreadId::new(100 + i));
                t
            })
            .collect();

        let attacher = {
            let p = Arc::clone(&p);
            let late = late.clone();
            os::spawn(move || {
                for t in &late {
                    p.attach_thread(t);
                }
            })
        };
        p.begin_single_threading(keeper);
        attacher.join().unwrap();

        assert_eq!(p.thread_count(), 33);
        assert_eq!(p.single_count(), 32);
        assert!(late.iter().all(|t| t.has_flag(ThreadFlags::SUSPSINGLE)));
    }
}
