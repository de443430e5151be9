//! # Scheduler Metrics

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler counters
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    enqueues: AtomicU64,
    sleeps: AtomicU64,
    wakeups: AtomicU64,
    preemptions: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Threads made runnable
    pub enqueues: u64,
    /// Sleeps entered
    pub sleeps: u64,
    /// Wakeup calls
    pub wakeups: u64,
    /// Involuntary switches
    pub preemptions: u64,
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            enqueues: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
        }
    }

    /// Record a thread made runnable
    pub fn record_enqueue(&self) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sleep
    pub fn record_sleep(&self) {
        self.sleeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a wakeup
    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a preemption
    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
        }
    }
}
