//! # User Memory Access
//!
//! Word-granular copies between the kernel and a thread's address space.
//! Each copy arms [`COPY_FAULT`] on the thread for its duration. A page that
//! is not yet accessible goes through the kernel fault path exactly as a
//! hardware fault would; if that ends at the recovery point, the copy fails
//! with `EFAULT`.

use crate::dispatch::TrapDispatcher;
use crate::fault::KernelFault;
use crate::recovery::COPY_FAULT;
use crate::syscall::{SysError, SysResult};
use alloc::sync::Arc;
use kestrel_execution::errno::EFAULT;
use kestrel_execution::Thread;
use kestrel_hal::{FaultCause, Privilege, TrapFrame, VirtAddr, USER_END};
use kestrel_memory::{AddressSpace, MemError, MemResult};

const WORD: u64 = 8;

impl TrapDispatcher {
    /// Copy words in from user address `uaddr`
    pub fn copyin(&self, thread: &Arc<Thread>, uaddr: VirtAddr, out: &mut [u64]) -> SysResult {
        check_user_range(uaddr, out.len())?;
        self.with_copy_fault(thread, |this| {
            for (i, slot) in out.iter_mut().enumerate() {
                let addr = uaddr.offset(i as u64 * WORD);
                *slot = this.access(thread, addr, FaultCause::empty(), |vm| vm.read_word(addr))?;
            }
            Ok(())
        })
    }

    /// Copy words out to user address `uaddr`
    pub fn copyout(&self, thread: &Arc<Thread>, uaddr: VirtAddr, words: &[u64]) -> SysResult {
        check_user_range(uaddr, words.len())?;
        self.with_copy_fault(thread, |this| {
            for (i, &word) in words.iter().enumerate() {
                let addr = uaddr.offset(i as u64 * WORD);
                this.access(thread, addr, FaultCause::WRITE, |vm| vm.write_word(addr, word))?;
            }
            Ok(())
        })
    }

    fn with_copy_fault(&self, thread: &Arc<Thread>, copy: impl FnOnce(&Self) -> SysResult) -> SysResult {
        let saved = thread.onfault();
        thread.set_onfault(COPY_FAULT);
        let result = copy(self);
        thread.set_onfault(saved);
        result
    }

    /// One word access, taking a kernel page fault if the page is not ready
    fn access<T>(
        &self,
        thread: &Arc<Thread>,
        addr: VirtAddr,
        cause: FaultCause,
        op: impl Fn(&AddressSpace) -> MemResult<T>,
    ) -> Result<T, SysError> {
        let vm = thread.process().ok_or(SysError::Errno(EFAULT))?.vm();
        match op(&vm) {
            Ok(value) => return Ok(value),
            Err(MemError::WouldFault) => {}
            Err(_) => return Err(SysError::Errno(EFAULT)),
        }

        let mut frame = TrapFrame::page_fault(Privilege::Kernel, addr.as_u64(), cause);
        match self.kernel_page_fault(Some(thread), self.cpu_of(thread), &mut frame) {
            KernelFault::Resolved => op(&vm).map_err(|_| SysError::Errno(EFAULT)),
            KernelFault::Recovered(_) | KernelFault::Unhandled(_) => Err(SysError::Errno(EFAULT)),
        }
    }
}

fn check_user_range(uaddr: VirtAddr, words: usize) -> SysResult {
    let len = (words as u64).checked_mul(WORD).ok_or(SysError::Errno(EFAULT))?;
    match uaddr.as_u64().checked_add(len) {
        Some(end) if end <= USER_END => Ok(()),
        _ => Err(SysError::Errno(EFAULT)),
    }
}
