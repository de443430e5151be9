//! # Frame Pool
//!
//! Counts free physical frames. Callers take frames in batches and give them
//! back on release; a [`FrameLease`] does the giving back on drop.

use crate::{MemError, MemResult};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Pool of interchangeable physical frames
#[derive(Debug)]
pub struct FramePool {
    /// Frames managed by the pool
    total: u64,
    /// Frames currently free
    free: AtomicU64,
}

impl FramePool {
    /// Create a pool with `total` free frames
    pub const fn new(total: u64) -> Self {
        Self {
            total,
            free: AtomicU64::new(total),
        }
    }

    /// Total frames
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Free frames
    pub fn free(&self) -> u64 {
        self.free.load(Ordering::Acquire)
    }

    /// Take `count` frames, all or nothing
    pub fn try_take(&self, count: u64) -> MemResult<()> {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                free.checked_sub(count)
            })
            .map(|_| ())
            .map_err(|_| MemError::OutOfMemory)
    }

    /// Return `count` frames
    pub fn give_back(&self, count: u64) {
        let prev = self.free.fetch_add(count, Ordering::AcqRel);
        debug_assert!(prev + count <= self.total, "frame pool overflow");
    }

    /// Take `count` frames held until the lease is dropped
    pub fn lease(self: &Arc<Self>, count: u64) -> MemResult<FrameLease> {
        self.try_take(count)?;
        Ok(FrameLease {
            pool: Arc::clone(self),
            count,
        })
    }
}

/// Frames held on behalf of one owner (e.g. a kernel stack)
#[derive(Debug)]
pub struct FrameLease {
    pool: Arc<FramePool>,
    count: u64,
}

impl FrameLease {
    /// Number of frames held
    pub fn frames(&self) -> u64 {
        self.count
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.pool.give_back(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_is_all_or_nothing() {
        let pool = FramePool::new(4);
        assert!(pool.try_take(3).is_ok());
        assert_eq!(pool.try_take(2), Err(MemError::OutOfMemory));
        assert_eq!(pool.free(), 1);
        pool.give_back(3);
        assert_eq!(pool.free(), 4);
    }

    #[test]
    fn test_lease_returns_frames() {
        let pool = Arc::new(FramePool::new(8));
        {
            let lease = pool.lease(4).unwrap();
            assert_eq!(lease.frames(), 4);
            assert_eq!(pool.free(), 4);
            assert!(pool.lease(5).is_err());
        }
        assert_eq!(pool.free(), 8);
    }
}
