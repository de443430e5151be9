//! # Credentials
//!
//! Credentials are immutable once built. Holding a reference is cloning the
//! `Arc`; changing identity means installing a new `Arc` on the process and
//! letting each thread pick it up on its next return to user mode.

use alloc::sync::Arc;

/// User and group identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Effective user id
    pub uid: u32,
    /// Real user id
    pub ruid: u32,
    /// Effective group id
    pub gid: u32,
    /// Real group id
    pub rgid: u32,
}

impl Credentials {
    /// Superuser credentials
    pub fn root() -> Arc<Self> {
        Self::user(0, 0)
    }

    /// Credentials for an ordinary user
    pub fn user(uid: u32, gid: u32) -> Arc<Self> {
        Arc::new(Self {
            uid,
            ruid: uid,
            gid,
            rgid: gid,
        })
    }

    /// Is this the superuser?
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}
