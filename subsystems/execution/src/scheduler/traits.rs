//! # Scheduler Traits
//!
//! The interface process creation and trap handling use to place, park and
//! preempt threads.

use super::Priority;
use crate::thread::Thread;
use crate::{ProcessId, ThreadId};
use alloc::sync::Arc;
use kestrel_hal::CpuId;

/// Something a thread can sleep on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WaitChannel {
    /// A process structure (vfork parents sleep on themselves)
    Process(ProcessId),
    /// Arbitrary kernel address
    Address(u64),
}

/// The scheduler
///
/// Every call may come from any CPU.
pub trait Scheduler: Send + Sync + core::fmt::Debug {
    /// Get the scheduler name
    fn name(&self) -> &'static str;

    /// Pick the CPU a new thread should start on
    fn choose_cpu(&self, thread: &Arc<Thread>) -> CpuId;

    /// Make `thread` runnable on `cpu`
    fn enqueue_runnable(&self, thread: &Arc<Thread>, cpu: CpuId);

    /// Bind an idle thread to its CPU without queueing it
    fn bind_to_cpu(&self, thread: &Arc<Thread>, cpu: CpuId);

    /// Put `thread` to sleep on `chan` for as long as `cond` holds
    ///
    /// `cond` is re-checked after every wakeup so a wakeup that races with
    /// going to sleep is never lost.
    fn sleep(&self, thread: &Arc<Thread>, chan: WaitChannel, cond: &dyn Fn() -> bool);

    /// Wake every thread sleeping on `chan`
    fn wakeup(&self, chan: WaitChannel);

    /// Give up the CPU because a reschedule was requested
    fn preempt(&self, thread: &Arc<Thread>);
}

/// Run queue trait
pub trait RunQueue: Send + Sync {
    /// Add a thread to the queue
    fn enqueue(&mut self, id: ThreadId, priority: Priority);

    /// Remove and return the next thread
    fn dequeue(&mut self) -> Option<ThreadId>;
}
