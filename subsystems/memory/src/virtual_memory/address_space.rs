//! # Address Space Management
//!
//! An address space is a set of non-overlapping regions plus the pages that
//! have been faulted in. Resident pages are charged against the frame pool;
//! fork duplicates the region list and shares resident pages copy-on-write.

use super::AddressSpaceId;
use crate::{AccessType, FramePool, MemError, MemResult, ProtectionFlags, RegionKind, VmRegion};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::{VirtAddr, KERNEL_BASE, PAGE_SIZE, USER_END};
use spin::RwLock;

/// How far below a stack region a stack pointer may sit and still be
/// considered a stack access
pub const STACK_GUARD_TOLERANCE: u64 = 16 * PAGE_SIZE;

static_assertions::const_assert!(STACK_GUARD_TOLERANCE % PAGE_SIZE == 0);

/// Which half of the address space a map covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// The shared kernel map
    Kernel,
    /// A process map
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageEntry {
    /// A frame was taken from the pool for this page
    charged: bool,
    /// Shared with another space until the next write
    cow: bool,
}

#[derive(Debug, Clone, Default)]
struct SpaceState {
    regions: BTreeMap<u64, VmRegion>,
    pages: BTreeMap<u64, PageEntry>,
    words: BTreeMap<u64, u64>,
    stack_pages: u64,
}

impl SpaceState {
    fn find(&self, addr: VirtAddr) -> Option<&VmRegion> {
        self.regions
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    fn accessible(&self, addr: VirtAddr, access: AccessType) -> bool {
        let Some(region) = self.find(addr) else {
            return false;
        };
        if !access.permitted_by(region.protection) {
            return false;
        }
        match self.pages.get(&addr.page().as_u64()) {
            Some(entry) => !(access == AccessType::Write && entry.cow),
            None => false,
        }
    }
}

/// Address space
#[derive(Debug)]
pub struct AddressSpace {
    /// Address space ID
    id: AddressSpaceId,
    /// Kernel or user map
    kind: SpaceKind,
    /// Frames backing resident pages
    frames: Arc<FramePool>,
    /// Regions, resident pages and contents
    state: RwLock<SpaceState>,
    /// Faults taken against this space
    faults: AtomicU64,
}

impl AddressSpace {
    /// Create an empty user address space
    pub fn new_user(frames: Arc<FramePool>) -> Self {
        Self {
            id: AddressSpaceId::allocate(),
            kind: SpaceKind::User,
            frames,
            state: RwLock::new(SpaceState::default()),
            faults: AtomicU64::new(0),
        }
    }

    /// Create the kernel address space
    pub fn kernel(frames: Arc<FramePool>) -> Self {
        Self {
            id: AddressSpaceId::KERNEL,
            kind: SpaceKind::Kernel,
            frames,
            state: RwLock::new(SpaceState::default()),
            faults: AtomicU64::new(0),
        }
    }

    /// Get address space ID
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Kernel or user map
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Is this the kernel map?
    pub fn is_kernel(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    /// Add a region
    pub fn add_region(&self, region: VmRegion) -> MemResult<()> {
        if region.size == 0 {
            return Err(MemError::InvalidSize);
        }
        let in_range = match self.kind {
            SpaceKind::User => region.end().as_u64() <= USER_END && region.end() > region.start,
            SpaceKind::Kernel => region.start.as_u64() >= KERNEL_BASE && region.end() > region.start,
        };
        if !in_range {
            return Err(MemError::InvalidAddress);
        }

        let mut state = self.state.write();
        if state.regions.values().any(|r| r.overlaps(&region)) {
            return Err(MemError::AlreadyMapped);
        }
        state.regions.insert(region.start.as_u64(), region);
        Ok(())
    }

    /// Map anonymous memory at a fixed address
    pub fn map_anonymous(&self, start: VirtAddr, size: u64, prot: ProtectionFlags) -> MemResult<VirtAddr> {
        let kind = if self.is_kernel() {
            RegionKind::Kernel
        } else {
            RegionKind::Anonymous
        };
        let region = VmRegion::new(start, size, prot, kind);
        let addr = region.start;
        self.add_region(region)?;
        Ok(addr)
    }

    /// Map a read/write stack of `size` bytes ending at `top`
    pub fn map_stack(&self, top: VirtAddr, size: u64) -> MemResult<VirtAddr> {
        let top = top.page();
        let size = VirtAddr::new(size).align_up(PAGE_SIZE).as_u64();
        let start = top
            .as_u64()
            .checked_sub(size)
            .ok_or(MemError::InvalidAddress)?;
        let region = VmRegion::new(VirtAddr::new(start), size, ProtectionFlags::RW, RegionKind::Stack);
        self.add_region(region)?;
        Ok(VirtAddr::new(start))
    }

    /// Map a file-backed region
    pub fn map_file(
        &self,
        start: VirtAddr,
        size: u64,
        prot: ProtectionFlags,
        io_error: bool,
    ) -> MemResult<VirtAddr> {
        let region = VmRegion::new(start, size, prot, RegionKind::File { io_error });
        let addr = region.start;
        self.add_region(region)?;
        Ok(addr)
    }

    /// Remove a region and release its resident pages
    pub fn remove_region(&self, start: VirtAddr) -> MemResult<VmRegion> {
        let mut state = self.state.write();
        let region = state
            .regions
            .remove(&start.as_u64())
            .ok_or(MemError::NotMapped)?;

        let range = region.start.as_u64()..region.end().as_u64();
        let mut released = 0;
        state.pages.retain(|va, entry| {
            let gone = range.contains(va);
            if gone && entry.charged {
                released += 1;
            }
            !gone
        });
        state.words.retain(|va, _| !range.contains(va));
        drop(state);

        self.frames.give_back(released);
        Ok(region)
    }

    /// Find region containing address
    pub fn find_region(&self, addr: VirtAddr) -> Option<VmRegion> {
        self.state.read().find(addr).cloned()
    }

    /// Resolve a fault at `addr` for `access`
    ///
    /// Makes the containing page resident (or private, for a write to a
    /// copy-on-write page). Fails with `NotMapped` outside every region,
    /// `PermissionDenied` when the region forbids the access, `Io` when the
    /// backing object cannot be read and `OutOfMemory` when no frame is
    /// left.
    pub fn resolve_fault(&self, addr: VirtAddr, access: AccessType) -> MemResult<()> {
        self.faults.fetch_add(1, Ordering::Relaxed);
        let page = addr.page();

        let mut state = self.state.write();
        let (protection, kind) = match state.find(page) {
            Some(region) => (region.protection, region.kind),
            None => return Err(MemError::NotMapped),
        };
        if !access.permitted_by(protection) {
            return Err(MemError::PermissionDenied);
        }

        match state.pages.get_mut(&page.as_u64()) {
            Some(entry) => {
                if access == AccessType::Write && entry.cow {
                    if !entry.charged {
                        self.frames.try_take(1)?;
                        entry.charged = true;
                    }
                    entry.cow = false;
                }
            }
            None => {
                if kind == (RegionKind::File { io_error: true }) {
                    return Err(MemError::Io);
                }
                self.frames.try_take(1)?;
                state.pages.insert(
                    page.as_u64(),
                    PageEntry {
                        charged: true,
                        cow: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Account stack growth for a resolved fault at `addr`
    ///
    /// Returns true when `addr` lies in a stack region.
    pub fn grow(&self, addr: VirtAddr) -> bool {
        let mut state = self.state.write();
        let Some(region) = state.find(addr).filter(|r| r.is_stack()) else {
            return false;
        };
        let used = (region.end().as_u64() - addr.page().as_u64()) / PAGE_SIZE;
        if used > state.stack_pages {
            log::trace!("stack grows to {} pages at {:#x}", used, addr);
            state.stack_pages = used;
        }
        true
    }

    /// Is `sp` a plausible stack pointer?
    ///
    /// Accepts a pointer inside any mapping, or one at most
    /// [`STACK_GUARD_TOLERANCE`] below a stack region.
    pub fn check_stack_pointer(&self, sp: VirtAddr) -> bool {
        let state = self.state.read();
        if state.find(sp).is_some() {
            return true;
        }
        state.regions.values().any(|r| {
            r.is_stack() && r.start > sp && r.start.as_u64() - sp.as_u64() <= STACK_GUARD_TOLERANCE
        })
    }

    /// Copy-on-write duplicate for fork
    ///
    /// Both spaces keep the resident pages, marked copy-on-write; the child's
    /// copies are not charged until it writes to them.
    pub fn duplicate_for_fork(&self) -> AddressSpace {
        let mut state = self.state.write();
        for entry in state.pages.values_mut() {
            entry.cow = true;
        }
        let mut child_state = state.clone();
        drop(state);

        for entry in child_state.pages.values_mut() {
            entry.charged = false;
        }

        AddressSpace {
            id: AddressSpaceId::allocate(),
            kind: self.kind,
            frames: Arc::clone(&self.frames),
            state: RwLock::new(child_state),
            faults: AtomicU64::new(0),
        }
    }

    /// Data size in pages (anonymous regions)
    pub fn dsize_pages(&self) -> u64 {
        self.state
            .read()
            .regions
            .values()
            .filter(|r| r.kind == RegionKind::Anonymous)
            .map(VmRegion::pages)
            .sum()
    }

    /// Stack size in pages, as grown so far
    pub fn ssize_pages(&self) -> u64 {
        self.state.read().stack_pages
    }

    /// Resident pages
    pub fn resident_pages(&self) -> usize {
        self.state.read().pages.len()
    }

    /// Is the page containing `addr` shared copy-on-write?
    pub fn is_cow(&self, addr: VirtAddr) -> bool {
        self.state
            .read()
            .pages
            .get(&addr.page().as_u64())
            .is_some_and(|e| e.cow)
    }

    /// Faults taken against this space
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Load a word without faulting
    ///
    /// Returns `WouldFault` when the access needs [`resolve_fault`](Self::resolve_fault)
    /// first.
    pub fn read_word(&self, addr: VirtAddr) -> MemResult<u64> {
        if !addr.is_aligned(8) {
            return Err(MemError::InvalidAddress);
        }
        let state = self.state.read();
        if !state.accessible(addr, AccessType::Read) {
            return Err(MemError::WouldFault);
        }
        Ok(state.words.get(&addr.as_u64()).copied().unwrap_or(0))
    }

    /// Store a word without faulting
    pub fn write_word(&self, addr: VirtAddr, value: u64) -> MemResult<()> {
        if !addr.is_aligned(8) {
            return Err(MemError::InvalidAddress);
        }
        let mut state = self.state.write();
        if !state.accessible(addr, AccessType::Write) {
            return Err(MemError::WouldFault);
        }
        state.words.insert(addr.as_u64(), value);
        Ok(())
    }

    /// Store a word, faulting the page in first if needed
    pub fn copyout_word(&self, addr: VirtAddr, value: u64) -> MemResult<()> {
        match self.write_word(addr, value) {
            Err(MemError::WouldFault) => {
                self.resolve_fault(addr, AccessType::Write)?;
                self.write_word(addr, value)
            }
            other => other,
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let charged = self
            .state
            .get_mut()
            .pages
            .values()
            .filter(|e| e.charged)
            .count() as u64;
        self.frames.give_back(charged);
    }
}
