//! # File Descriptor Tables
//!
//! A table maps descriptor numbers to open files. Sharing a table is cloning
//! its `Arc`; copying one builds a new table that references the same open
//! files.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// An open file
#[derive(Debug)]
pub struct OpenFile {
    /// Path it was opened by
    pub path: String,
    /// Current offset
    offset: AtomicU64,
}

impl OpenFile {
    /// Open file at offset 0
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            offset: AtomicU64::new(0),
        })
    }

    /// Current offset
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Move the offset
    pub fn seek(&self, offset: u64) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

/// File descriptor table
#[derive(Debug, Default)]
pub struct FileTable {
    slots: Mutex<Vec<Option<Arc<OpenFile>>>>,
}

impl FileTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `file` at the lowest free descriptor
    pub fn install(&self, file: Arc<OpenFile>) -> usize {
        let mut slots = self.slots.lock();
        if let Some(fd) = slots.iter().position(Option::is_none) {
            slots[fd] = Some(file);
            fd
        } else {
            slots.push(Some(file));
            slots.len() - 1
        }
    }

    /// Close a descriptor
    pub fn close(&self, fd: usize) -> Option<Arc<OpenFile>> {
        self.slots.lock().get_mut(fd).and_then(Option::take)
    }

    /// Look up a descriptor
    pub fn get(&self, fd: usize) -> Option<Arc<OpenFile>> {
        self.slots.lock().get(fd).cloned().flatten()
    }

    /// Open descriptors
    pub fn open_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Independent table holding the same open files
    pub fn copy(&self) -> Self {
        Self {
            slots: Mutex::new(self.slots.lock().clone()),
        }
    }
}
