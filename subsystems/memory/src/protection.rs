//! # Memory Protection

use bitflags::bitflags;

bitflags! {
    /// Memory protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtectionFlags: u32 {
        /// No access
        const NONE = 0;
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Execute access
        const EXECUTE = 1 << 2;
        /// Read + Write
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Read + Execute
        const RX = Self::READ.bits() | Self::EXECUTE.bits();
        /// Read + Write + Execute (dangerous!)
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// The kind of access a fault (or a copy) needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Load
    Read,
    /// Store
    Write,
    /// Instruction fetch
    Execute,
}

impl AccessType {
    /// Protection bit this access requires
    pub const fn required(self) -> ProtectionFlags {
        match self {
            AccessType::Read => ProtectionFlags::READ,
            AccessType::Write => ProtectionFlags::WRITE,
            AccessType::Execute => ProtectionFlags::EXECUTE,
        }
    }

    /// Is this access allowed under `prot`?
    pub fn permitted_by(self, prot: ProtectionFlags) -> bool {
        prot.contains(self.required())
    }
}
