//! # Admission Control
//!
//! Global thread and process counters plus per-user process counts. Each
//! counter is checked and bumped in one atomic step, so N concurrent
//! callers can never all take the last slot.
//!
//! Admission hands out tickets. Dropping a ticket undoes its increment;
//! committing it keeps the slot until the thread or process is released.

use crate::limits::{LimitStore, Resource};
use crate::{ExecError, ExecResult};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::Clock;
use spin::Mutex;

/// Suppresses repeats of a diagnostic within an interval
#[derive(Debug)]
pub struct RateLimiter {
    /// Tick of the last allowed event, plus one (0 = never)
    last: AtomicU64,
    interval: u64,
}

impl RateLimiter {
    /// Allow at most one event per `interval` ticks
    pub const fn new(interval: u64) -> Self {
        Self {
            last: AtomicU64::new(0),
            interval,
        }
    }

    /// Should an event at `now` be let through?
    pub fn check(&self, now: u64) -> bool {
        let last = self.last.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last - 1) < self.interval {
            return false;
        }
        self.last
            .compare_exchange(last, now + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Thread/process ceilings
#[derive(Debug)]
pub struct Admission {
    threads: AtomicU64,
    processes: AtomicU64,
    per_uid: Mutex<BTreeMap<u32, u64>>,
    max_threads: u64,
    max_processes: u64,
    headroom: u64,
    thread_full: RateLimiter,
    process_full: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl Admission {
    /// Create admission control with the given ceilings
    pub fn new(
        max_threads: u64,
        max_processes: u64,
        headroom: u64,
        warn_interval: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            threads: AtomicU64::new(0),
            processes: AtomicU64::new(0),
            per_uid: Mutex::new(BTreeMap::new()),
            max_threads,
            max_processes,
            headroom,
            thread_full: RateLimiter::new(warn_interval),
            process_full: RateLimiter::new(warn_interval),
            clock,
        }
    }

    fn bump(counter: &AtomicU64, limit: u64) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn limit_for(&self, max: u64, uid: u32) -> u64 {
        if uid == 0 {
            max
        } else {
            max.saturating_sub(self.headroom)
        }
    }

    fn table_full(&self, limiter: &RateLimiter, table: &str) {
        if limiter.check(self.clock.now_ticks()) {
            log::warn!("{}: table is full", table);
        }
    }

    /// Take a thread slot
    pub fn admit_thread(&self, uid: u32) -> ExecResult<ThreadTicket<'_>> {
        if !Self::bump(&self.threads, self.limit_for(self.max_threads, uid)) {
            self.table_full(&self.thread_full, "thread");
            return Err(ExecError::ResourceExhausted);
        }
        Ok(ThreadTicket {
            admission: self,
            armed: true,
        })
    }

    /// Take a process slot and a slot in `uid`'s process count
    ///
    /// Root is not subject to the per-user limit.
    pub fn admit_process(&self, uid: u32, limits: &dyn LimitStore) -> ExecResult<ProcessTicket<'_>> {
        if !Self::bump(&self.processes, self.limit_for(self.max_processes, uid)) {
            self.table_full(&self.process_full, "process");
            return Err(ExecError::ResourceExhausted);
        }

        let mut per_uid = self.per_uid.lock();
        let count = per_uid.entry(uid).or_insert(0);
        if uid != 0 && *count + 1 > limits.current_limit(uid, Resource::Processes) {
            drop(per_uid);
            self.processes.fetch_sub(1, Ordering::AcqRel);
            return Err(ExecError::ResourceExhausted);
        }
        *count += 1;
        drop(per_uid);

        Ok(ProcessTicket {
            admission: self,
            uid,
            armed: true,
        })
    }

    /// Give back a committed thread slot
    pub fn release_thread(&self) {
        let prev = self.threads.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "thread count underflow");
    }

    /// Give back a committed process slot
    pub fn release_process(&self, uid: u32) {
        let prev = self.processes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "process count underflow");
        let mut per_uid = self.per_uid.lock();
        if let Some(count) = per_uid.get_mut(&uid) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_uid.remove(&uid);
            }
        }
    }

    /// Live threads
    pub fn threads(&self) -> u64 {
        self.threads.load(Ordering::Acquire)
    }

    /// Live processes (zombies included)
    pub fn processes(&self) -> u64 {
        self.processes.load(Ordering::Acquire)
    }

    /// Processes owned by `uid`
    pub fn processes_of(&self, uid: u32) -> u64 {
        self.per_uid.lock().get(&uid).copied().unwrap_or(0)
    }
}

/// An admitted thread slot
#[derive(Debug)]
#[must_use = "dropping a ticket releases the slot"]
pub struct ThreadTicket<'a> {
    admission: &'a Admission,
    armed: bool,
}

impl ThreadTicket<'_> {
    /// Keep the slot
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for ThreadTicket<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.admission.release_thread();
        }
    }
}

/// An admitted process slot
#[derive(Debug)]
#[must_use = "dropping a ticket releases the slot"]
pub struct ProcessTicket<'a> {
    admission: &'a Admission,
    uid: u32,
    armed: bool,
}

impl ProcessTicket<'_> {
    /// Keep the slot
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessTicket<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.admission.release_process(self.uid);
        }
    }
}
