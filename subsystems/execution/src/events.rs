//! # Process Events
//!
//! Notifications for observers watching a process (kqueue-style
//! `NOTE_FORK`/`NOTE_EXIT`).

use crate::ProcessId;
use alloc::vec::Vec;
use spin::Mutex;

/// Something that happened to a watched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process forked `child`
    Fork {
        /// New process
        child: ProcessId,
    },
    /// The process exited
    Exit,
}

/// Receives process events
pub trait EventSink: Send + Sync + core::fmt::Debug {
    /// `subject` had `event`
    fn notify(&self, subject: ProcessId, event: ProcessEvent);
}

/// Event sink that keeps events until drained
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<Vec<(ProcessId, ProcessEvent)>>,
}

impl EventQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<(ProcessId, ProcessEvent)> {
        core::mem::take(&mut *self.events.lock())
    }

    /// Queued events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for EventQueue {
    fn notify(&self, subject: ProcessId, event: ProcessEvent) {
        self.events.lock().push((subject, event));
    }
}
