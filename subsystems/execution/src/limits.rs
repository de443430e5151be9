//! # Resource Limits
//!
//! Per-process limit snapshots. Forked processes share their parent's
//! snapshot through an `Arc`; changing a limit replaces the snapshot.

/// Limited resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Data segment size in bytes
    Data,
    /// Stack size in bytes
    Stack,
    /// Processes per user
    Processes,
    /// Open files
    OpenFiles,
}

/// Where admission control reads limits from
pub trait LimitStore: Send + Sync {
    /// Current (soft) limit of `kind` for `uid`
    fn current_limit(&self, uid: u32, kind: Resource) -> u64;
}

/// A limit snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    data: u64,
    stack: u64,
    processes: u64,
    open_files: u64,
}

impl Limits {
    /// No limit
    pub const INFINITY: u64 = u64::MAX;

    /// Default limits for process 0
    pub const fn new() -> Self {
        Self {
            data: Self::INFINITY,
            stack: 8 * 1024 * 1024,
            processes: Self::INFINITY,
            open_files: 512,
        }
    }

    /// Copy with a different per-user process limit
    pub fn with_processes(&self, processes: u64) -> Self {
        Self {
            processes,
            ..self.clone()
        }
    }

    /// Current value of a limit
    pub fn current(&self, kind: Resource) -> u64 {
        match kind {
            Resource::Data => self.data,
            Resource::Stack => self.stack,
            Resource::Processes => self.processes,
            Resource::OpenFiles => self.open_files,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

impl LimitStore for Limits {
    fn current_limit(&self, _uid: u32, kind: Resource) -> u64 {
        self.current(kind)
    }
}
