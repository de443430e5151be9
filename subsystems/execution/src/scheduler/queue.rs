//! # Scheduler Run Queues

use super::traits::RunQueue;
use super::Priority;
use crate::ThreadId;
use alloc::collections::VecDeque;

/// Simple FIFO run queue
#[derive(Debug, Default)]
pub struct FifoQueue {
    queue: VecDeque<ThreadId>,
}

impl FifoQueue {
    /// Create a new FIFO queue
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Queued threads, front first
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.queue.iter().copied()
    }
}

impl RunQueue for FifoQueue {
    fn enqueue(&mut self, id: ThreadId, _priority: Priority) {
        self.queue.push_back(id);
    }

    fn dequeue(&mut self) -> Option<ThreadId> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = FifoQueue::new();
        for raw in 1..=3 {
            q.enqueue(ThreadId::new(raw), Priority::DEFAULT);
        }
        assert_eq!(q.dequeue(), Some(ThreadId::new(1)));
        assert_eq!(q.iter().collect::<alloc::vec::Vec<_>>(), [ThreadId::new(2), ThreadId::new(3)]);
        assert_eq!(q.dequeue(), Some(ThreadId::new(2)));
        assert_eq!(q.dequeue(), Some(ThreadId::new(3)));
        assert_eq!(q.dequeue(), None);
    }
}
