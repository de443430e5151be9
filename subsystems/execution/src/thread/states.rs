//! # Thread States
//!
//! Thread state machine definition.

/// Thread state (unit-only for atomic storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ThreadState {
    /// Thread is being constructed
    #[default]
    Embryonic = 0,
    /// Thread is on a run queue
    Runnable = 1,
    /// Thread is currently running
    Running = 2,
    /// Thread is sleeping on a wait channel
    Sleeping = 3,
    /// Thread is stopped (by signal or debugger)
    Stopped = 4,
    /// Thread has exited
    Zombie = 5,
}

impl ThreadState {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Embryonic),
            1 => Some(Self::Runnable),
            2 => Some(Self::Running),
            3 => Some(Self::Sleeping),
            4 => Some(Self::Stopped),
            5 => Some(Self::Zombie),
            _ => None,
        }
    }

    /// Convert to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for raw in 0..6 {
            let state = ThreadState::from_u32(raw).unwrap();
            assert_eq!(state.as_u32(), raw);
        }
        assert_eq!(ThreadState::from_u32(6), None);
    }
}
