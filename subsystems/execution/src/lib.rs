//! # Kestrel Execution Subsystem
//!
//! The execution subsystem manages:
//! - Process and thread identifiers
//! - Admission control against system-wide and per-user ceilings
//! - Thread and process construction
//! - The fork orchestrator (`fork1`, `thread_fork`, kernel threads)
//! - The global process/thread registry
//!
//! ## Key Principle
//!
//! Creation is split in two phases. Everything that can fail happens while
//! admitting the request and yields an admission value; construction takes
//! that value and cannot fail.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

pub mod admission;
pub mod config;
pub mod cred;
pub mod events;
pub mod files;
pub mod fork;
pub mod ids;
pub mod kernel;
pub mod limits;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod thread;


pub use config::ExecConfig;
pub use fork::{ForkFlags, ForkStats, ThreadEntry};
pub use kernel::{Kernel, Services};
pub use process::{Process, ProcessFlags, TraceMask};
pub use thread::{Thread, ThreadFlags, ThreadState};

/// Unique identifier for threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Wrap a raw id
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Unique identifier for processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The swapper (process 0)
    pub const SWAPPER: Self = Self(0);

    /// Wrap a raw id
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// BSD errno values returned to userland
pub mod errno {
    /// No such process
    pub const ESRCH: i32 = 3;
    /// Cannot allocate memory
    pub const ENOMEM: i32 = 12;
    /// Bad address
    pub const EFAULT: i32 = 14;
    /// File exists
    pub const EEXIST: i32 = 17;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Resource temporarily unavailable
    pub const EAGAIN: i32 = 35;
    /// Function not implemented
    pub const ENOSYS: i32 = 78;
}

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Thread or process table is full, or the per-user limit was hit
    ResourceExhausted,
    /// No memory for a kernel stack
    OutOfMemory,
    /// Invalid argument
    InvalidArgument,
    /// Process not found
    ProcessNotFound,
    /// Thread not found
    ThreadNotFound,
    /// Already exists
    AlreadyExists,
}

impl ExecError {
    /// errno reported to userland
    pub const fn errno(self) -> i32 {
        match self {
            ExecError::ResourceExhausted => errno::EAGAIN,
            ExecError::OutOfMemory => errno::ENOMEM,
            ExecError::InvalidArgument => errno::EINVAL,
            ExecError::ProcessNotFound | ExecError::ThreadNotFound => errno::ESRCH,
            ExecError::AlreadyExists => errno::EEXIST,
        }
    }
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ExecError::ResourceExhausted => "resource temporarily unavailable",
            ExecError::OutOfMemory => "cannot allocate memory",
            ExecError::InvalidArgument => "invalid argument",
            ExecError::ProcessNotFound => "no such process",
            ExecError::ThreadNotFound => "no such thread",
            ExecError::AlreadyExists => "already exists",
        };
        f.write_str(s)
    }
}
