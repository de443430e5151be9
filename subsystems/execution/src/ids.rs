//! # Identifier Allocation
//!
//! Pids come from `(floor, pid_max]`, either sequentially or drawn at random
//! with a re-draw on collision. Tids are drawn from `[1, tid_max]`. The
//! caller supplies the collision check; the registry runs allocation and
//! insertion under one lock.
//!
//! Freed pids go into a small ring so they are not handed out again right
//! away. The ring is a best-effort delay, not a liveness guarantee: once 128
//! more pids have been freed the oldest one is forgotten.

use crate::config::ExecConfig;
use crate::{ProcessId, ThreadId};
use heapless::HistoryBuffer;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Capacity of the freed-pid ring
pub const PID_QUARANTINE: usize = 128;

/// Offset added to raw tids when they are shown to userland
pub const THREAD_PID_OFFSET: u32 = 100_000;

static_assertions::const_assert!(ExecConfig::TID_MAX < THREAD_PID_OFFSET);
static_assertions::const_assert!(ExecConfig::PID_MAX < THREAD_PID_OFFSET);

/// Pid and tid allocator
pub struct IdAllocator {
    rng: SmallRng,
    /// Last sequentially assigned pid; random pids are drawn above it
    last_pid: u32,
    pid_max: u32,
    tid_max: u32,
    random_pids: bool,
    draw_attempts: u32,
    freed: HistoryBuffer<u32, PID_QUARANTINE>,
}

impl core::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdAllocator")
            .field("last_pid", &self.last_pid)
            .field("random_pids", &self.random_pids)
            .field("quarantined", &self.freed.len())
            .finish_non_exhaustive()
    }
}

impl IdAllocator {
    /// Create an allocator from the configuration
    pub fn new(config: &ExecConfig) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(config.rng_seed),
            last_pid: 0,
            pid_max: config.pid_max.max(2),
            tid_max: config.tid_max.max(2),
            random_pids: config.random_pids,
            draw_attempts: config.pid_draw_attempts,
            freed: HistoryBuffer::new(),
        }
    }

    /// Switch between sequential and random pids
    pub fn set_random_pids(&mut self, random: bool) {
        self.random_pids = random;
    }

    /// Are pids random?
    pub fn random_pids(&self) -> bool {
        self.random_pids
    }

    /// Was `pid` freed recently?
    pub fn is_quarantined(&self, pid: u32) -> bool {
        self.freed.as_slice().contains(&pid)
    }

    /// Allocate a pid for which `taken` is false
    ///
    /// `taken` must cover live processes, zombies, process groups and
    /// reservations; the quarantine ring is checked here. A quarantined pid
    /// is handed out only when nothing else is free. `None` means every pid
    /// is taken.
    pub fn allocate_pid(&mut self, taken: impl Fn(u32) -> bool) -> Option<ProcessId> {
        let busy = |alloc: &Self, pid: u32| alloc.is_quarantined(pid) || taken(pid);

        if !self.random_pids {
            let start = self.last_pid;
            for step in 1..=self.pid_max {
                let pid = (start + step - 1) % self.pid_max + 1;
                if !busy(self, pid) {
                    self.last_pid = pid;
                    return Some(ProcessId::new(pid));
                }
            }
        } else {
            let floor = self.last_pid.min(self.pid_max - 1);
            for _ in 0..self.draw_attempts {
                let pid = self.rng.gen_range(floor + 1..=self.pid_max);
                if !busy(self, pid) {
                    return Some(ProcessId::new(pid));
                }
            }
            log::debug!("pid draws exhausted, scanning");
            let scan = (floor + 1..=self.pid_max).chain(1..=floor);
            for pid in scan {
                if !busy(self, pid) {
                    return Some(ProcessId::new(pid));
                }
            }
        }

        match (1..=self.pid_max).find(|&pid| !taken(pid)) {
            Some(pid) => {
                log::warn!("pid space crowded, reusing quarantined pid {}", pid);
                Some(ProcessId::new(pid))
            }
            None => {
                log::warn!("pid space exhausted");
                None
            }
        }
    }

    /// Allocate a tid for which `taken` is false; `None` if every tid is taken
    pub fn allocate_tid(&mut self, taken: impl Fn(u32) -> bool) -> Option<ThreadId> {
        for _ in 0..self.draw_attempts.max(1) {
            let tid = self.rng.gen_range(1..=self.tid_max);
            if !taken(tid) {
                return Some(ThreadId::new(tid));
            }
        }
        let start = self.rng.gen_range(1..=self.tid_max);
        let found = (start..=self.tid_max).chain(1..start).find(|&tid| !taken(tid));
        if found.is_none() {
            log::warn!("tid space exhausted");
        }
        found.map(ThreadId::new)
    }

    /// Put a freed pid into the quarantine ring, evicting the oldest entry
    pub fn release_pid(&mut self, pid: ProcessId) {
        self.freed.write(pid.as_u32());
    }
}
