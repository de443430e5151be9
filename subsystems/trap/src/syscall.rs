//! # Syscall Gate
//!
//! The calling convention:
//!
//! - The call number arrives in [`reg::SYSNO`]. Numbers 0 (`syscall`) and
//!   198 (`__syscall`) are indirect: the real number is the first argument
//!   and the arguments shift down by one register.
//! - The first [`reg::ARG_COUNT`] arguments come in registers; the rest are
//!   copied in from the user stack, just above the return address.
//! - On success both result registers are written and the carry flag is
//!   cleared. On failure the errno goes in the first result register and the
//!   carry flag is set. A restart backs the program counter up over the
//!   trapping instruction; a plain return leaves the frame alone.

use crate::dispatch::TrapDispatcher;
use crate::sysent::{self, SyscallDescriptor, MAX_SYSCALL_ARGS};
use alloc::sync::Arc;
use kestrel_execution::{ExecError, Thread};
use kestrel_hal::trap::{reg, SYSCALL_INSN_LEN};
use kestrel_hal::{TrapFlags, TrapFrame, VirtAddr};

/// How a syscall failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Re-execute the trapping instruction
    Restart,
    /// Return without touching the frame
    JustReturn,
    /// Report an errno
    Errno(i32),
}

impl From<ExecError> for SysError {
    fn from(err: ExecError) -> Self {
        SysError::Errno(err.errno())
    }
}

/// Result of a syscall implementation
pub type SysResult = Result<(), SysError>;

/// Write a syscall's outcome into the frame
pub fn encode_result(frame: &mut TrapFrame, result: SysResult, rval: [u64; 2]) {
    match result {
        Ok(()) => {
            frame.set_return(rval[0], rval[1]);
            frame.flags.remove(TrapFlags::CARRY);
        }
        Err(SysError::Restart) => {
            frame.pc = frame.pc.wrapping_sub(SYSCALL_INSN_LEN);
        }
        Err(SysError::JustReturn) => {}
        Err(SysError::Errno(errno)) => {
            frame.regs[reg::RET0] = errno as u64;
            frame.flags.insert(TrapFlags::CARRY);
        }
    }
}

/// A decoded call, arguments gathered
struct Marshalled {
    code: u64,
    descriptor: &'static SyscallDescriptor,
    args: [u64; MAX_SYSCALL_ARGS],
}

impl TrapDispatcher {
    /// Handle a syscall trap from `thread`
    pub fn handle_syscall(&self, thread: &Arc<Thread>, frame: &mut TrapFrame) {
        self.stats.record_syscall();
        // The entry frame is what a forking call copies into the child.
        thread.save_frame(frame);

        let mut rval = [0, frame.regs[reg::RET1]];
        let result = self.marshal(thread, frame).and_then(|call| {
            let args = &call.args[..call.descriptor.argsize];
            log::trace!(
                "syscall: tid {} {}({}) {:x?}",
                thread.tid().as_u32(),
                call.descriptor.name,
                call.code,
                args
            );
            (call.descriptor.call)(self, thread, args, &mut rval)
        });
        if let Err(err) = result {
            log::trace!("syscall: tid {} -> {:?}", thread.tid().as_u32(), err);
        }

        encode_result(frame, result, rval);
        self.userret(thread, frame);
    }

    fn marshal(&self, thread: &Arc<Thread>, frame: &TrapFrame) -> Result<Marshalled, SysError> {
        let mut code = frame.regs[reg::SYSNO];
        let mut regs = frame.args();
        if code == sysent::SYS_SYSCALL as u64 || code == sysent::SYS___SYSCALL as u64 {
            code = regs[0];
            regs = &regs[1..];
        }

        let descriptor = sysent::lookup(code);
        let mut args = [0u64; MAX_SYSCALL_ARGS];
        let in_regs = descriptor.argsize.min(regs.len());
        args[..in_regs].copy_from_slice(&regs[..in_regs]);

        if descriptor.argsize > in_regs {
            let spill = VirtAddr::new(frame.sp).offset(8);
            self.copyin(thread, spill, &mut args[in_regs..descriptor.argsize])?;
        }

        Ok(Marshalled {
            code,
            descriptor,
            args,
        })
    }
}
