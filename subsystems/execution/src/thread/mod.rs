//! # Thread Management
//!
//! Thread control blocks, their construction and lifecycle states.

pub mod states;
#[allow(clippy::module_inception)]
pub mod thread;

pub use states::*;
pub use thread::*;
