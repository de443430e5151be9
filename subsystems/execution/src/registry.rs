//! # Process and Thread Registry
//!
//! Global lookup structures for processes, zombies, process groups and
//! threads.
//!
//! Id allocation happens under the allocator lock, so two concurrent
//! callers never get the same id. Ids are handed out as reservations: a pid
//! stays taken from the moment it is drawn until the process is published,
//! and a tid until its thread is registered. Dropping an uncommitted
//! reservation frees the id again. An exhausted id space is an error, never
//! a reused live id.

use crate::config::ExecConfig;
use crate::ids::IdAllocator;
use crate::process::{Process, ProcessFlags};
use crate::thread::Thread;
use crate::{ExecError, ExecResult, ProcessId, ThreadId};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};
use spin::{Mutex, RwLock};

/// Process and thread registry
#[derive(Debug)]
pub struct Registry {
    ids: Mutex<IdAllocator>,
    processes: RwLock<BTreeMap<ProcessId, Arc<Process>>>,
    zombies: RwLock<BTreeMap<ProcessId, Arc<Process>>>,
    /// Process group id -> member count
    groups: RwLock<BTreeMap<ProcessId, usize>>,
    reserved: RwLock<BTreeSet<ProcessId>>,
    reserved_tids: RwLock<BTreeSet<ThreadId>>,
    threads: RwLock<BTreeMap<ThreadId, Arc<Thread>>>,
}

/// A pid held for a process under construction
#[derive(Debug)]
#[must_use = "dropping a reservation frees the pid"]
pub struct PidReservation<'a> {
    registry: &'a Registry,
    pid: ProcessId,
    armed: bool,
}

impl PidReservation<'_> {
    /// The reserved pid
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Keep the pid held until [`Registry::publish_process`]
    pub fn commit(mut self) -> ProcessId {
        self.armed = false;
        self.pid
    }
}

impl Drop for PidReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.reserved.write().remove(&self.pid);
        }
    }
}

/// A tid held for a thread under construction
#[derive(Debug)]
#[must_use = "dropping a reservation frees the tid"]
pub struct TidReservation<'a> {
    registry: &'a Registry,
    tid: ThreadId,
    armed: bool,
}

impl TidReservation<'_> {
    /// The reserved tid
    pub fn tid(&self) -> ThreadId {
        self.tid
    }
}

impl Drop for TidReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.reserved_tids.write().remove(&self.tid);
        }
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new(config: &ExecConfig) -> Self {
        Self {
            ids: Mutex::new(IdAllocator::new(config)),
            processes: RwLock::new(BTreeMap::new()),
            zombies: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            reserved: RwLock::new(BTreeSet::new()),
            reserved_tids: RwLock::new(BTreeSet::new()),
            threads: RwLock::new(BTreeMap::new()),
        }
    }

    /// Is `pid` held by a process, zombie, group or reservation?
    ///
    /// The quarantine ring is not consulted here.
    pub fn pid_taken(&self, pid: ProcessId) -> bool {
        self.processes.read().contains_key(&pid)
            || self.zombies.read().contains_key(&pid)
            || self.groups.read().contains_key(&pid)
            || self.reserved.read().contains(&pid)
    }

    /// Draw a fresh pid
    ///
    /// Fails with `ResourceExhausted` if every pid is taken.
    pub fn reserve_pid(&self) -> ExecResult<PidReservation<'_>> {
        let mut ids = self.ids.lock();
        let pid = ids
            .allocate_pid(|raw| self.pid_taken(ProcessId::new(raw)))
            .ok_or(ExecError::ResourceExhausted)?;
        debug_assert!(!self.pid_taken(pid), "allocated a pid in use");
        self.reserved.write().insert(pid);
        Ok(PidReservation {
            registry: self,
            pid,
            armed: true,
        })
    }

    /// Draw a fresh tid
    ///
    /// Fails with `ResourceExhausted` if every tid is taken.
    pub fn reserve_tid(&self) -> ExecResult<TidReservation<'_>> {
        let mut ids = self.ids.lock();
        let mut reserved = self.reserved_tids.write();
        let threads = self.threads.read();
        let taken = |tid: ThreadId| threads.contains_key(&tid) || reserved.contains(&tid);
        let tid = ids
            .allocate_tid(|raw| taken(ThreadId::new(raw)))
            .ok_or(ExecError::ResourceExhausted)?;
        debug_assert!(!taken(tid), "allocated a tid in use");
        reserved.insert(tid);
        Ok(TidReservation {
            registry: self,
            tid,
            armed: true,
        })
    }

    /// Give `thread` its reserved tid and insert it
    pub fn register_thread(&self, thread: &Arc<Thread>, mut reservation: TidReservation<'_>) -> ThreadId {
        let tid = reservation.tid;
        let mut reserved = self.reserved_tids.write();
        let mut threads = self.threads.write();
        reserved.remove(&tid);
        reservation.armed = false;
        thread.set_tid(tid);
        let previous = threads.insert(tid, Arc::clone(thread));
        debug_assert!(previous.is_none(), "tid {} registered twice", tid.as_u32());
        tid
    }

    /// Insert a thread that already has an id (boot thread)
    pub fn insert_thread(&self, thread: &Arc<Thread>) -> ExecResult<()> {
        let reserved = self.reserved_tids.read();
        let mut threads = self.threads.write();
        let tid = thread.tid();
        if threads.contains_key(&tid) || reserved.contains(&tid) {
            return Err(ExecError::AlreadyExists);
        }
        threads.insert(tid, Arc::clone(thread));
        Ok(())
    }

    /// Remove a thread from the index
    pub fn unregister_thread(&self, tid: ThreadId) -> ExecResult<Arc<Thread>> {
        self.threads
            .write()
            .remove(&tid)
            .ok_or(ExecError::ThreadNotFound)
    }

    /// Make a fully built process visible to pid lookup
    ///
    /// Lookups still skip it until `EMBRYO` is cleared.
    pub fn publish_process(&self, process: &Arc<Process>) {
        // Every field written so far must be visible to whoever finds it.
        fence(Ordering::Release);
        let pid = process.pid();
        self.processes.write().insert(pid, Arc::clone(process));
        *self.groups.write().entry(process.pgid()).or_insert(0) += 1;
        self.reserved.write().remove(&pid);
    }

    /// Find a live, fully constructed process
    pub fn find_process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        let process = self.processes.read().get(&pid).cloned()?;
        fence(Ordering::Acquire);
        if process.is_embryo() {
            None
        } else {
            Some(process)
        }
    }

    /// Find a zombie
    pub fn find_zombie(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.zombies.read().get(&pid).cloned()
    }

    /// Find a thread
    pub fn find_thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.threads.read().get(&tid).cloned()
    }

    /// Live, fully constructed processes
    pub fn processes(&self) -> Vec<Arc<Process>> {
        self.processes
            .read()
            .values()
            .filter(|p| !p.is_embryo())
            .cloned()
            .collect()
    }

    /// Number of processes in the index, embryos included
    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    /// Number of threads in the index
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Move an exited process to the zombie list; its pid stays taken
    pub fn make_zombie(&self, pid: ProcessId) -> ExecResult<Arc<Process>> {
        let process = self
            .processes
            .write()
            .remove(&pid)
            .ok_or(ExecError::ProcessNotFound)?;
        process.set_flag(ProcessFlags::ZOMBIE);
        self.zombies.write().insert(pid, Arc::clone(&process));
        Ok(process)
    }

    /// Remove a zombie for good and quarantine its pid
    pub fn remove_zombie(&self, pid: ProcessId) -> ExecResult<Arc<Process>> {
        let mut ids = self.ids.lock();
        let process = self
            .zombies
            .write()
            .remove(&pid)
            .ok_or(ExecError::ProcessNotFound)?;
        let mut groups = self.groups.write();
        if let Some(count) = groups.get_mut(&process.pgid()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                groups.remove(&process.pgid());
            }
        }
        ids.release_pid(pid);
        Ok(process)
    }

    /// Insert process 0; it is never an embryo
    pub fn insert_swapper(&self, process: &Arc<Process>) {
        self.publish_process(process);
    }

    /// Switch pid allocation mode
    pub fn set_random_pids(&self, random: bool) {
        self.ids.lock().set_random_pids(random);
    }

    /// Was `pid` freed recently?
    pub fn is_quarantined(&self, pid: ProcessId) -> bool {
        self.ids.lock().is_quarantined(pid.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::Credentials;
    use crate::fork::ForkFlags;
    use crate::limits::Limits;
    use crate::thread::KernelStack;
    use kestrel_memory::{AddressSpace, FramePool};
    extern crate std;
    use std::collections::BTreeSet as StdSet;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec as StdVec;

    fn thread(pool: &Arc<FramePool>) -> Arc<Thread> {
        Arc::new(Thread::bootstrap(
            KernelStack::allocate(pool, 1).unwrap(),
            Credentials::root(),
        ))
    }

    fn swapper(registry: &Registry, pool: &Arc<FramePool>) -> Arc<Process> {
        let vm = Arc::new(AddressSpace::new_user(Arc::clone(pool)));
        let p = Process::bootstrap(thread(pool), vm, Credentials::root(), Arc::new(Limits::default()));
        registry.insert_swapper(&p);
        p
    }

    #[test]
    fn test_embryo_is_invisible_until_cleared() {
        let pool = Arc::new(FramePool::new(64));
        let registry = Registry::new(&ExecConfig::small());
        let parent = swapper(&registry, &pool);

        let pid = registry.reserve_pid().unwrap().commit();
        assert!(registry.pid_taken(pid));
        assert!(registry.find_process(pid).is_none());

        let child = Process::fork_from(pid, &parent, &thread(&pool), ForkFlags::FORK);
        registry.publish_process(&child);
        assert!(registry.find_process(pid).is_none());
        assert!(registry.processes().iter().all(|p| p.pid() != pid));

        child.clear_flag(ProcessFlags::EMBRYO);
        assert!(Arc::ptr_eq(&registry.find_process(pid).unwrap(), &child));
    }

    #[test]
    fn test_reserved_pid_is_not_reissued() {
        let registry = Registry::new(&ExecConfig::small());
        let a = registry.reserve_pid().unwrap();
        let b = registry.reserve_pid().unwrap();
        assert_ne!(a.pid(), b.pid());

        let dropped = a.pid();
        drop(a);
        assert!(!registry.pid_taken(dropped));
        let kept = b.commit();
        assert!(registry.pid_taken(kept));
    }

    #[test]
    fn test_exhausted_tids_are_refused() {
        let pool = Arc::new(FramePool::new(64));
        let config = ExecConfig {
            tid_max: 2,
            ..ExecConfig::small()
        };
        let registry = Registry::new(&config);
        let first = thread(&pool);
        let tid = registry.register_thread(&first, registry.reserve_tid().unwrap());
        let held = registry.reserve_tid().unwrap();
        assert_ne!(held.tid(), tid);

        assert_eq!(registry.reserve_tid().unwrap_err(), ExecError::ResourceExhausted);
        assert!(Arc::ptr_eq(&registry.find_thread(tid).unwrap(), &first));

        drop(held);
        assert!(registry.reserve_tid().is_ok());
    }

    #[test]
    fn test_exhausted_pids_are_refused() {
        let config = ExecConfig {
            pid_max: 2,
            ..ExecConfig::small()
        };
        let registry = Registry::new(&config);
        let a = registry.reserve_pid().unwrap().commit();
        let b = registry.reserve_pid().unwrap().commit();
        assert_ne!(a, b);
        assert_eq!(registry.reserve_pid().unwrap_err(), ExecError::ResourceExhausted);
    }

    #[test]
    fn test_zombie_keeps_pid_then_quarantines() {
        let pool = Arc::new(FramePool::new(64));
        let registry = Registry::new(&ExecConfig::small());
        let parent = swapper(&registry, &pool);
        let pid = registry.reserve_pid().unwrap().commit();
        let child = Process::fork_from(pid, &parent, &thread(&pool), ForkFlags::FORK);
        registry.publish_process(&child);
        child.clear_flag(ProcessFlags::EMBRYO);

        registry.make_zombie(pid).unwrap();
        assert!(registry.find_process(pid).is_none());
        assert!(registry.pid_taken(pid));
        registry.remove_zombie(pid).unwrap();
        assert!(!registry.pid_taken(pid));
        assert!(registry.is_quarantined(pid));
        assert_eq!(registry.remove_zombie(pid).unwrap_err(), ExecError::ProcessNotFound);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let pool = Arc::new(FramePool::new(1024));
        let registry = Registry::new(&ExecConfig::randomized(7));
        let pids = StdMutex::new(StdVec::new());
        let tids = StdMutex::new(StdVec::new());

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..50 {
                        pids.lock().unwrap().push(registry.reserve_pid().unwrap().commit());
                        let t = thread(&pool);
                        let tid = registry.reserve_tid().unwrap();
                        tids.lock().unwrap().push(registry.register_thread(&t, tid));
                    }
                });
            }
        });

        let pids = pids.into_inner().unwrap();
        let tids = tids.into_inner().unwrap();
        assert_eq!(pids.iter().collect::<StdSet<_>>().len(), pids.len());
        assert_eq!(tids.iter().collect::<StdSet<_>>().len(), tids.len());
        assert_eq!(registry.thread_count(), 200);
    }
}
