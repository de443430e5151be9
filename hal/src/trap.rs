//! # Trap Frames
//!
//! Architecture-neutral trap state. The low-level entry stubs save the
//! interrupted context into a [`TrapFrame`] and hand it to the kernel's
//! trap dispatcher; on return the (possibly modified) frame is restored.
//!
//! ## Trap Categories
//! - **Faults**: the program counter names the faulting instruction
//! - **Traps**: reported after the instruction retires
//! - **Aborts**: no reliable recovery (double fault, machine check)

use bitflags::bitflags;

/// Trap numbers as delivered by the entry stubs
///
/// The numbering is kernel-internal and dense, so it doubles as an index
/// into [`TRAP_NAMES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TrapKind {
    /// Privileged or illegal instruction
    PrivilegedInstruction = 0,
    /// Breakpoint instruction
    Breakpoint = 1,
    /// Floating point exception
    Arithmetic = 2,
    /// Asynchronous system trap (software)
    Ast = 3,
    /// General protection fault
    Protection = 4,
    /// Single-step / debug trap
    Trace = 5,
    /// Page fault
    PageFault = 6,
    /// Alignment check
    Alignment = 7,
    /// Integer divide fault
    Divide = 8,
    /// Non-maskable interrupt
    Nmi = 9,
    /// Overflow trap
    Overflow = 10,
    /// Bounds check fault
    Bound = 11,
    /// FPU not available
    DeviceNotAvailable = 12,
    /// Double fault
    DoubleFault = 13,
    /// FPU operand fetch fault
    FpuOperand = 14,
    /// Invalid TSS
    InvalidTss = 15,
    /// Segment not present
    SegmentNotPresent = 16,
    /// Stack fault
    StackFault = 17,
    /// Machine check
    MachineCheck = 18,
    /// SIMD floating point exception
    Simd = 19,
    /// Virtualization exception
    Virtualization = 20,
    /// Control protection (branch target) fault
    ControlProtection = 21,
}

/// Printable trap names, indexed by trap number
pub const TRAP_NAMES: [&str; 22] = [
    "privileged instruction fault",
    "breakpoint trap",
    "arithmetic trap",
    "asynchronous system trap",
    "protection fault",
    "trace trap",
    "page fault",
    "alignment fault",
    "integer divide fault",
    "non-maskable interrupt",
    "overflow trap",
    "bounds check fault",
    "FPU not available fault",
    "double fault",
    "FPU operand fetch fault",
    "invalid TSS fault",
    "segment not present fault",
    "stack fault",
    "machine check",
    "SSE FP exception",
    "virtualization exception",
    "control protection exception",
];

impl TrapKind {
    const ALL: [TrapKind; 22] = [
        TrapKind::PrivilegedInstruction,
        TrapKind::Breakpoint,
        TrapKind::Arithmetic,
        TrapKind::Ast,
        TrapKind::Protection,
        TrapKind::Trace,
        TrapKind::PageFault,
        TrapKind::Alignment,
        TrapKind::Divide,
        TrapKind::Nmi,
        TrapKind::Overflow,
        TrapKind::Bound,
        TrapKind::DeviceNotAvailable,
        TrapKind::DoubleFault,
        TrapKind::FpuOperand,
        TrapKind::InvalidTss,
        TrapKind::SegmentNotPresent,
        TrapKind::StackFault,
        TrapKind::MachineCheck,
        TrapKind::Simd,
        TrapKind::Virtualization,
        TrapKind::ControlProtection,
    ];

    /// Decode a raw trap number
    pub fn from_number(trapno: u64) -> Option<Self> {
        usize::try_from(trapno)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Raw trap number
    #[inline]
    pub const fn number(self) -> u64 {
        self as u64
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        TRAP_NAMES[self as usize]
    }
}

/// Formats a trap number the way diagnostics print it
///
/// Known numbers print their name, anything else `unknown trap N`.
#[derive(Debug, Clone, Copy)]
pub struct TrapName(pub u64);

impl core::fmt::Display for TrapName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match TrapKind::from_number(self.0) {
            Some(kind) => f.write_str(kind.name()),
            None => write!(f, "unknown trap {}", self.0),
        }
    }
}

bitflags! {
    /// Page fault error code bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultCause: u64 {
        /// The fault was caused by a present page (protection violation)
        const PRESENT = 1 << 0;
        /// The fault was caused by a write
        const WRITE = 1 << 1;
        /// The fault was caused in user mode
        const USER = 1 << 2;
        /// A reserved bit was set in the page table
        const RESERVED = 1 << 3;
        /// The fault was caused by an instruction fetch
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

bitflags! {
    /// Saved processor status flags the kernel cares about
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TrapFlags: u64 {
        /// Carry flag, the syscall error indicator
        const CARRY = 1 << 0;
        /// Interrupts enabled
        const INTERRUPT = 1 << 9;
        /// Alignment check / SMAP override
        const ALIGNMENT_CHECK = 1 << 18;
    }
}

/// Privilege level the trap was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// Supervisor mode
    Kernel,
    /// User mode
    User,
}

/// General purpose register slots in [`TrapFrame::regs`]
pub mod reg {
    /// First return value; holds the syscall number on syscall entry
    pub const RET0: usize = 0;
    /// Syscall number register (aliases `RET0`)
    pub const SYSNO: usize = RET0;
    /// Second return value
    pub const RET1: usize = 1;
    /// First argument register
    pub const ARG0: usize = 2;
    /// Number of argument registers
    pub const ARG_COUNT: usize = 6;
    /// Total number of saved general purpose registers
    pub const COUNT: usize = 16;
}

/// Length of the syscall instruction, used to back up on restart
pub const SYSCALL_INSN_LEN: u64 = 2;

/// Saved context of an interrupted thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapFrame {
    /// Trap number
    pub trapno: u64,
    /// Hardware error code
    pub err: u64,
    /// Faulting address (page faults)
    pub addr: u64,
    /// Program counter
    pub pc: u64,
    /// Stack pointer
    pub sp: u64,
    /// Status flags
    pub flags: TrapFlags,
    /// Mode the trap came from
    pub privilege: Privilege,
    /// General purpose registers
    pub regs: [u64; reg::COUNT],
}

static_assertions::const_assert!(reg::ARG0 + reg::ARG_COUNT <= reg::COUNT);

impl TrapFrame {
    /// A zeroed frame for the given trap
    pub const fn new(kind: TrapKind, privilege: Privilege) -> Self {
        Self {
            trapno: kind as u64,
            err: 0,
            addr: 0,
            pc: 0,
            sp: 0,
            flags: TrapFlags::empty(),
            privilege,
            regs: [0; reg::COUNT],
        }
    }

    /// Frame for a page fault at `addr`
    pub const fn page_fault(privilege: Privilege, addr: u64, cause: FaultCause) -> Self {
        let mut frame = Self::new(TrapKind::PageFault, privilege);
        frame.addr = addr;
        frame.err = cause.bits();
        frame
    }

    /// Frame for a syscall entry with the given number and register arguments
    ///
    /// Syscall entries carry the software trap number.
    pub fn syscall(code: u64, args: &[u64]) -> Self {
        let mut frame = Self::new(TrapKind::Ast, Privilege::User);
        frame.regs[reg::SYSNO] = code;
        for (slot, value) in frame.regs[reg::ARG0..reg::ARG0 + reg::ARG_COUNT]
            .iter_mut()
            .zip(args)
        {
            *slot = *value;
        }
        frame
    }

    /// Decoded trap kind
    #[inline]
    pub fn kind(&self) -> Option<TrapKind> {
        TrapKind::from_number(self.trapno)
    }

    /// Page fault cause bits
    #[inline]
    pub fn fault_cause(&self) -> FaultCause {
        FaultCause::from_bits_truncate(self.err)
    }

    /// Did the trap come from user mode?
    #[inline]
    pub fn from_user(&self) -> bool {
        self.privilege == Privilege::User
    }

    /// Argument register `index` (0-based)
    #[inline]
    pub fn arg(&self, index: usize) -> u64 {
        self.regs[reg::ARG0 + index]
    }

    /// Register arguments as a slice
    #[inline]
    pub fn args(&self) -> &[u64] {
        &self.regs[reg::ARG0..reg::ARG0 + reg::ARG_COUNT]
    }

    /// First return register
    #[inline]
    pub fn ret0(&self) -> u64 {
        self.regs[reg::RET0]
    }

    /// Set the return registers
    #[inline]
    pub fn set_return(&mut self, rv0: u64, rv1: u64) {
        self.regs[reg::RET0] = rv0;
        self.regs[reg::RET1] = rv1;
    }

    /// Dump the frame to the log
    pub fn log(&self, header: &str) {
        log::error!("=== {} ===", header);
        log::error!("  trap:  {} ({})", self.trapno, TrapName(self.trapno));
        log::error!("  PC:    {:#018x}", self.pc);
        log::error!("  SP:    {:#018x}", self.sp);
        log::error!("  ADDR:  {:#018x}", self.addr);
        log::error!("  ERR:   {:#x}", self.err);
        log::error!("  FLAGS: {:?}", self.flags);
        log::error!("  MODE:  {:?}", self.privilege);
    }
}
