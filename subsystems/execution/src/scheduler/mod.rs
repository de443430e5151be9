//! # Scheduler Framework
//!
//! Process creation only needs a narrow slice of a scheduler: pick a CPU,
//! queue a thread, park a thread until a condition clears and honour a
//! reschedule request. [`Scheduler`] is that slice; [`RunQueueScheduler`]
//! is the default implementation with one FIFO queue per CPU.

pub mod metrics;
pub mod priority;
pub mod queue;
pub mod traits;

use crate::thread::{Thread, ThreadState};
use crate::ThreadId;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kestrel_hal::CpuId;
use spin::Mutex;

pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use priority::*;
pub use queue::FifoQueue;
pub use traits::*;

/// Round-robin placement over per-CPU FIFO queues
#[derive(Debug)]
pub struct RunQueueScheduler {
    queues: Vec<Mutex<FifoQueue>>,
    next_cpu: AtomicUsize,
    sleepers: Mutex<Vec<(WaitChannel, ThreadId)>>,
    metrics: SchedulerMetrics,
}

impl RunQueueScheduler {
    /// One queue per CPU; at least one
    pub fn new(cpu_count: usize) -> Self {
        Self {
            queues: (0..cpu_count.max(1)).map(|_| Mutex::new(FifoQueue::new())).collect(),
            next_cpu: AtomicUsize::new(0),
            sleepers: Mutex::new(Vec::new()),
            metrics: SchedulerMetrics::new(),
        }
    }

    fn queue(&self, cpu: CpuId) -> &Mutex<FifoQueue> {
        let idx = cpu.index() % self.queues.len();
        &self.queues[idx]
    }

    /// Pick the next thread queued on `cpu`
    pub fn pick_next(&self, cpu: CpuId) -> Option<ThreadId> {
        self.queue(cpu).lock().dequeue()
    }

    /// Threads queued on `cpu`, front first
    pub fn queued(&self, cpu: CpuId) -> Vec<ThreadId> {
        self.queue(cpu).lock().iter().collect()
    }

    /// Threads currently asleep
    pub fn sleeping(&self) -> usize {
        self.sleepers.lock().len()
    }

    /// Scheduler counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Scheduler for RunQueueScheduler {
    fn name(&self) -> &'static str {
        "runqueue"
    }

    fn choose_cpu(&self, _thread: &Arc<Thread>) -> CpuId {
        let n = self.next_cpu.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        CpuId(n as u32)
    }

    fn enqueue_runnable(&self, thread: &Arc<Thread>, cpu: CpuId) {
        thread.set_cpu(cpu);
        thread.set_state(ThreadState::Runnable);
        self.queue(cpu).lock().enqueue(thread.tid(), thread.priority());
        self.metrics.record_enqueue();
    }

    fn bind_to_cpu(&self, thread: &Arc<Thread>, cpu: CpuId) {
        thread.set_cpu(cpu);
    }

    fn sleep(&self, thread: &Arc<Thread>, chan: WaitChannel, cond: &dyn Fn() -> bool) {
        if !cond() {
            return;
        }
        let tid = thread.tid();
        self.sleepers.lock().push((chan, tid));
        thread.set_state(ThreadState::Sleeping);
        self.metrics.record_sleep();
        // Without a context switch to park on, wait for the condition itself.
        while cond() {
            core::hint::spin_loop();
        }
        self.sleepers.lock().retain(|&(c, t)| !(c == chan && t == tid));
        thread.set_state(ThreadState::Running);
    }

    fn wakeup(&self, chan: WaitChannel) {
        self.metrics.record_wakeup();
        let woken = self.sleepers.lock().iter().filter(|(c, _)| *c == chan).count();
        if woken > 0 {
            log::trace!("wakeup {:?}: {} sleeper(s)", chan, woken);
        }
    }

    fn preempt(&self, thread: &Arc<Thread>) {
        self.metrics.record_preemption();
        log::trace!("preempt tid {}", thread.tid().as_u32());
    }
}
