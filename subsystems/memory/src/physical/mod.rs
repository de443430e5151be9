//! # Physical Memory Management

pub mod frame_allocator;

pub use frame_allocator::{FrameLease, FramePool};
