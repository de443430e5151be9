//! # System Call Table
//!
//! Indexed by call number. Unassigned numbers and numbers past the end
//! resolve to entry 0, which raises SIGSYS and fails with `ENOSYS`.

use crate::dispatch::TrapDispatcher;
use crate::syscall::{SysError, SysResult};
use alloc::sync::Arc;
use core::fmt;
use kestrel_execution::errno::{EINVAL, ENOMEM, ENOSYS, ESRCH};
use kestrel_execution::ids::THREAD_PID_OFFSET;
use kestrel_execution::signal::Signal;
use kestrel_execution::{ForkFlags, Thread, ThreadEntry, TraceMask};
use kestrel_hal::VirtAddr;
use kestrel_memory::{MemError, ProtectionFlags};
use static_assertions::const_assert;

/// Widest argument list of any call
pub const MAX_SYSCALL_ARGS: usize = 8;

/// Number of table slots
pub const SYS_MAXSYSCALL: usize = 331;

/// Indirect call
pub const SYS_SYSCALL: usize = 0;
/// fork
pub const SYS_FORK: usize = 2;
/// Thread creation
pub const SYS___TFORK: usize = 8;
/// getpid
pub const SYS_GETPID: usize = 20;
/// getuid
pub const SYS_GETUID: usize = 24;
/// getppid
pub const SYS_GETPPID: usize = 39;
/// vfork
pub const SYS_VFORK: usize = 66;
/// mmap, with a padding argument before the offset
pub const SYS_MMAP: usize = 197;
/// Indirect call with 64-bit number
pub const SYS___SYSCALL: usize = 198;
/// getthrid
pub const SYS_GETTHRID: usize = 299;

/// Syscall implementation
///
/// Gets the marshalled arguments and the two result slots, preloaded with 0
/// and the caller's second result register.
pub type SyscallFn = fn(&TrapDispatcher, &Arc<Thread>, &[u64], &mut [u64; 2]) -> SysResult;

/// One table entry
#[derive(Clone, Copy)]
pub struct SyscallDescriptor {
    /// Name for tracing
    pub name: &'static str,
    /// Argument count
    pub argsize: usize,
    /// Implementation
    pub call: SyscallFn,
}

impl SyscallDescriptor {
    const fn new(name: &'static str, argsize: usize, call: SyscallFn) -> Self {
        Self { name, argsize, call }
    }
}

impl fmt::Debug for SyscallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallDescriptor")
            .field("name", &self.name)
            .field("argsize", &self.argsize)
            .finish()
    }
}

const NOSYS: SyscallDescriptor = SyscallDescriptor::new("nosys", 0, sys_nosys);
const MMAP_ARGS: usize = 7;
const TFORK_PARAM_WORDS: usize = 3;

const_assert!(MMAP_ARGS <= MAX_SYSCALL_ARGS);
const_assert!(SYS_GETTHRID < SYS_MAXSYSCALL);

const fn build_sysent() -> [SyscallDescriptor; SYS_MAXSYSCALL] {
    let mut table = [NOSYS; SYS_MAXSYSCALL];
    table[SYS_SYSCALL] = SyscallDescriptor::new("syscall", 0, sys_nosys);
    table[SYS_FORK] = SyscallDescriptor::new("fork", 0, sys_fork);
    table[SYS___TFORK] = SyscallDescriptor::new("__tfork", 2, sys___tfork);
    table[SYS_GETPID] = SyscallDescriptor::new("getpid", 0, sys_getpid);
    table[SYS_GETUID] = SyscallDescriptor::new("getuid", 0, sys_getuid);
    table[SYS_GETPPID] = SyscallDescriptor::new("getppid", 0, sys_getppid);
    table[SYS_VFORK] = SyscallDescriptor::new("vfork", 0, sys_vfork);
    table[SYS_MMAP] = SyscallDescriptor::new("mmap", MMAP_ARGS, sys_mmap);
    table[SYS___SYSCALL] = SyscallDescriptor::new("__syscall", 0, sys_nosys);
    table[SYS_GETTHRID] = SyscallDescriptor::new("getthrid", 0, sys_getthrid);
    table
}

/// The system call table
pub static SYSENT: [SyscallDescriptor; SYS_MAXSYSCALL] = build_sysent();

/// Entry for a call number
pub fn lookup(code: u64) -> &'static SyscallDescriptor {
    usize::try_from(code)
        .ok()
        .and_then(|index| SYSENT.get(index))
        .unwrap_or(&SYSENT[SYS_SYSCALL])
}

fn sys_nosys(d: &TrapDispatcher, thread: &Arc<Thread>, _args: &[u64], _rval: &mut [u64; 2]) -> SysResult {
    d.kernel().services().signals.psignal(thread, Signal::SIGSYS);
    Err(SysError::Errno(ENOSYS))
}

/// A debugger that asked for fork reports gets the child traced as well
fn sys_fork(d: &TrapDispatcher, thread: &Arc<Thread>, _args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    let mut flags = ForkFlags::FORK;
    if thread
        .process()
        .is_some_and(|p| p.trace_mask().contains(TraceMask::FORK))
    {
        flags |= ForkFlags::PTRACE;
    }
    let pid = d.kernel().fork1(thread, flags, ThreadEntry::ChildReturn)?;
    rval[0] = u64::from(pid.as_u32());
    Ok(())
}

fn sys_vfork(d: &TrapDispatcher, thread: &Arc<Thread>, _args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    let pid = d.kernel().fork1(
        thread,
        ForkFlags::VFORK | ForkFlags::PPWAIT,
        ThreadEntry::ChildReturn,
    )?;
    rval[0] = u64::from(pid.as_u32());
    Ok(())
}

/// `__tfork(param, psize)`; `param` holds the TLS base, the tid pointer and
/// the stack, in that order
fn sys___tfork(d: &TrapDispatcher, thread: &Arc<Thread>, args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    let (param, psize) = (args[0], args[1]);
    let words = usize::try_from(psize.div_ceil(8)).map_err(|_| SysError::Errno(EINVAL))?;
    if words == 0 || words > TFORK_PARAM_WORDS {
        return Err(SysError::Errno(EINVAL));
    }

    let mut tfork = [0u64; TFORK_PARAM_WORDS];
    d.copyin(thread, VirtAddr::new(param), &mut tfork[..words])?;
    let [tcb, tidptr, stack] = tfork;

    let nonzero = |addr: u64| (addr != 0).then(|| VirtAddr::new(addr));
    let tid = d
        .kernel()
        .thread_fork(thread, nonzero(stack), tcb, nonzero(tidptr))?;
    rval[0] = u64::from(tid.as_u32() + THREAD_PID_OFFSET);
    Ok(())
}

fn sys_getpid(_d: &TrapDispatcher, thread: &Arc<Thread>, _args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    let process = thread.process().ok_or(SysError::Errno(ESRCH))?;
    rval[0] = u64::from(process.pid().as_u32());
    Ok(())
}

fn sys_getppid(_d: &TrapDispatcher, thread: &Arc<Thread>, _args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    let process = thread.process().ok_or(SysError::Errno(ESRCH))?;
    rval[0] = u64::from(process.ppid().as_u32());
    Ok(())
}

fn sys_getuid(_d: &TrapDispatcher, thread: &Arc<Thread>, _args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    rval[0] = u64::from(thread.cred().ruid);
    Ok(())
}

fn sys_getthrid(_d: &TrapDispatcher, thread: &Arc<Thread>, _args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    rval[0] = u64::from(thread.tid().as_u32() + THREAD_PID_OFFSET);
    Ok(())
}

const MAP_FIXED: u64 = 0x0010;
const MAP_ANON: u64 = 0x1000;

/// `mmap(addr, len, prot, flags, fd, pad, pos)`
///
/// Only fixed anonymous mappings are supported.
fn sys_mmap(_d: &TrapDispatcher, thread: &Arc<Thread>, args: &[u64], rval: &mut [u64; 2]) -> SysResult {
    let (addr, len, prot, flags) = (args[0], args[1], args[2], args[3]);
    if flags & MAP_ANON == 0 || flags & MAP_FIXED == 0 || len == 0 {
        return Err(SysError::Errno(EINVAL));
    }
    let addr = VirtAddr::new(addr);
    if !addr.is_aligned(kestrel_hal::PAGE_SIZE) {
        return Err(SysError::Errno(EINVAL));
    }
    let prot = ProtectionFlags::from_bits_truncate((prot & 0x7) as u32);

    let process = thread.process().ok_or(SysError::Errno(ESRCH))?;
    let start = process
        .vm()
        .map_anonymous(addr, len, prot)
        .map_err(|err| match err {
            MemError::OutOfMemory => SysError::Errno(ENOMEM),
            _ => SysError::Errno(EINVAL),
        })?;
    rval[0] = start.as_u64();
    Ok(())
}
