//! # Execution Configuration

use crate::ids::PID_QUARANTINE;
use kestrel_hal::clock::HZ;

/// Tunables for process and thread creation
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// System-wide thread ceiling
    pub max_threads: u64,
    /// System-wide process ceiling
    pub max_processes: u64,
    /// Slots below each ceiling reserved for root
    pub privileged_headroom: u64,
    /// Largest pid handed out
    pub pid_max: u32,
    /// Largest raw tid handed out
    pub tid_max: u32,
    /// Draw pids at random instead of sequentially
    pub random_pids: bool,
    /// Random draws before falling back to a linear scan
    pub pid_draw_attempts: u32,
    /// Minimum ticks between "table is full" warnings
    pub table_full_interval: u64,
    /// Pages in a thread's kernel stack
    pub uarea_pages: u64,
    /// Seed for id randomization
    pub rng_seed: u64,
}

impl ExecConfig {
    /// Default process ceiling
    pub const DEFAULT_MAX_PROCESSES: u64 = 1310;
    /// Default root headroom
    pub const DEFAULT_HEADROOM: u64 = 5;
    /// Largest pid
    pub const PID_MAX: u32 = 99_999;
    /// Largest raw tid
    pub const TID_MAX: u32 = 99_999;

    /// Create default configuration
    ///
    /// Pids start out sequential; the kernel switches to random pids once
    /// init is running.
    pub fn new() -> Self {
        Self {
            max_threads: 2 * Self::DEFAULT_MAX_PROCESSES,
            max_processes: Self::DEFAULT_MAX_PROCESSES,
            privileged_headroom: Self::DEFAULT_HEADROOM,
            pid_max: Self::PID_MAX,
            tid_max: Self::TID_MAX,
            random_pids: false,
            pid_draw_attempts: 64,
            table_full_interval: 10 * HZ,
            uarea_pages: 4,
            rng_seed: 0x6b65_7374_7265_6c00,
        }
    }

    /// Small tables for tests
    pub fn small() -> Self {
        Self {
            max_threads: 32,
            max_processes: 16,
            ..Self::new()
        }
    }

    /// Random pids from the start
    pub fn randomized(seed: u64) -> Self {
        Self {
            random_pids: true,
            rng_seed: seed,
            ..Self::new()
        }
    }

    /// Clamp the ceilings so the id spaces can never run dry
    ///
    /// Live processes, zombies and process groups together hold at most
    /// twice the process ceiling, plus the quarantine ring.
    pub fn validated(mut self) -> Self {
        let pid_room = (u64::from(self.pid_max).saturating_sub(PID_QUARANTINE as u64)) / 2;
        self.max_processes = self.max_processes.min(pid_room.saturating_sub(1)).max(1);
        let tid_room = u64::from(self.tid_max) / 2;
        self.max_threads = self.max_threads.min(tid_room).max(1);
        self.privileged_headroom = self
            .privileged_headroom
            .min(self.max_threads.min(self.max_processes) - 1);
        self.uarea_pages = self.uarea_pages.max(1);
        self
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self::new()
    }
}
