//! # Priority Management
//!
//! Defines priority levels. Lower values run first.

/// Thread priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Highest priority
    pub const MAX: Self = Self(0);

    /// Default user priority
    pub const DEFAULT: Self = Self(50);

    /// Priority a vfork parent waits at
    pub const PWAIT: Self = Self(32);

    /// Lowest priority
    pub const MIN: Self = Self(127);

    /// Create a priority, clamped to the valid range
    pub const fn new(value: u8) -> Self {
        Self(if value > Self::MIN.0 { Self::MIN.0 } else { value })
    }

    /// Raw value
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}
