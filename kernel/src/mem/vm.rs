/// Page tables for the lattice core: three levels, 4 KiB leaves, with 2 MiB
/// leaves for the big identity windows.
///
/// Bring-up runs with translation off, so table memory (fresh frames from
/// the frame allocator) is written through its physical address. The same
/// pointers stay valid afterwards because RAM is identity-mapped.
use bitflags::bitflags;
use core::fmt;
use static_assertions::const_assert_eq;

#[cfg(target_arch = "riscv64")]
use spin::Once;

use super::phys::{FrameAllocError, PhysAddr, FRAME_ALLOCATOR, PAGE_SIZE};

#[cfg(target_arch = "riscv64")]
use super::phys::{RAM_BASE, RAM_SIZE};

const ENTRIES_PER_TABLE: usize = 512;

/// Span of one level-1 leaf entry.
pub const MEGAPAGE_SIZE: usize = 512 * PAGE_SIZE;

bitflags! {
    /// Page table entry permission and status bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

/// A single page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

const_assert_eq!(core::mem::size_of::<Pte>(), 8);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    /// Encode a physical target and flags.
    pub fn new(target: PhysAddr, flags: PteFlags) -> Self {
        Pte(((target.as_usize() as u64 >> 12) << 10) | flags.bits())
    }

    pub fn is_valid(self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// A leaf carries at least one of R/W/X; a pointer entry carries none.
    pub fn is_leaf(self) -> bool {
        self.0 & (PteFlags::READ.bits() | PteFlags::WRITE.bits() | PteFlags::EXEC.bits()) != 0
    }

    pub fn target(self) -> PhysAddr {
        PhysAddr::new(((self.0 >> 10) << 12) as usize)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x})", self.0)
    }
}

/// Extract the table index for `level` (2 = root) from a virtual address.
pub fn table_index(va: usize, level: usize) -> usize {
    (va >> (12 + 9 * level)) & 0x1FF
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    NoFrames,
    AlreadyMapped,
    Unaligned,
    Uninitialized,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::NoFrames => write!(f, "no frames for page tables"),
            MapError::AlreadyMapped => write!(f, "address already mapped"),
            MapError::Unaligned => write!(f, "unaligned mapping request"),
            MapError::Uninitialized => write!(f, "virtual memory not initialized"),
        }
    }
}

impl From<FrameAllocError> for MapError {
    fn from(_: FrameAllocError) -> Self {
        MapError::NoFrames
    }
}

fn table_ptr(table: PhysAddr) -> *mut Pte {
    table.as_usize() as *mut Pte
}

unsafe fn zero_table(table: PhysAddr) {
    core::ptr::write_bytes(table_ptr(table), 0, ENTRIES_PER_TABLE);
}

unsafe fn entry_at(table: PhysAddr, index: usize) -> *mut Pte {
    table_ptr(table).add(index)
}

/// Walk one pointer level, allocating and installing a fresh table if the
/// slot is empty.
unsafe fn descend(table: PhysAddr, index: usize) -> Result<PhysAddr, MapError> {
    let slot = entry_at(table, index);
    let pte = slot.read_volatile();
    if pte.is_valid() {
        if pte.is_leaf() {
            return Err(MapError::AlreadyMapped);
        }
        return Ok(pte.target());
    }
    let fresh = FRAME_ALLOCATOR.alloc_frame()?;
    zero_table(fresh);
    slot.write_volatile(Pte::new(fresh, PteFlags::VALID));
    Ok(fresh)
}

/// Map one 4 KiB page, allocating intermediate tables as needed.
///
/// # Safety
/// `root` must be the root table of the address space under construction
/// (or the live one), with table memory reachable through physical
/// addressing.
pub unsafe fn map_page(
    root: PhysAddr,
    va: usize,
    pa: PhysAddr,
    flags: PteFlags,
) -> Result<(), MapError> {
    if va % PAGE_SIZE != 0 || pa.as_usize() % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }

    let mid = descend(root, table_index(va, 2))?;
    let leaf_table = descend(mid, table_index(va, 1))?;

    let slot = entry_at(leaf_table, table_index(va, 0));
    if slot.read_volatile().is_valid() {
        return Err(MapError::AlreadyMapped);
    }
    slot.write_volatile(Pte::new(
        pa,
        flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
    ));
    Ok(())
}

/// Identity-map `base .. base + len` with 2 MiB leaves.
///
/// # Safety
/// Same requirements as `map_page`.
pub unsafe fn map_identity_2m(
    root: PhysAddr,
    base: usize,
    len: usize,
    flags: PteFlags,
) -> Result<(), MapError> {
    if base % MEGAPAGE_SIZE != 0 || len % MEGAPAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }

    let mut va = base;
    while va < base + len {
        let mid = descend(root, table_index(va, 2))?;
        let slot = entry_at(mid, table_index(va, 1));
        if slot.read_volatile().is_valid() {
            return Err(MapError::AlreadyMapped);
        }
        slot.write_volatile(Pte::new(
            PhysAddr::new(va),
            flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY,
        ));
        va += MEGAPAGE_SIZE;
    }
    Ok(())
}

/// Proof that the one-shot virtual-memory bring-up completed.
///
/// Only `init` mints one (the in-crate mock machine mints its own for
/// host-target tests). Operations that must not run before translation is
/// live take it by reference, which turns the ordering requirement into a
/// compile-time obligation.
pub struct VmToken {
    _private: (),
}

impl VmToken {
    pub(crate) const fn new() -> Self {
        VmToken { _private: () }
    }
}

#[derive(Debug)]
pub enum VmInitError {
    NoFrames,
    Map(MapError),
}

impl fmt::Display for VmInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmInitError::NoFrames => write!(f, "no frames for the root table"),
            VmInitError::Map(err) => write!(f, "kernel mapping failed: {}", err),
        }
    }
}

impl From<MapError> for VmInitError {
    fn from(err: MapError) -> Self {
        VmInitError::Map(err)
    }
}

#[cfg(target_arch = "riscv64")]
static VM_ROOT: Once<PhysAddr> = Once::new();

/// One-shot virtual-memory bring-up: build the kernel address space
/// (identity-mapped RAM plus the device page) and switch translation on.
///
/// Mapped memory access is legal only after this returns. Only thread 0
/// runs before the release, so there is no racing caller; the `Once` makes
/// a second call observe the already-built root instead of rebuilding.
#[cfg(target_arch = "riscv64")]
pub fn init() -> Result<VmToken, VmInitError> {
    if VM_ROOT.get().is_some() {
        return Ok(VmToken::new());
    }

    let root = FRAME_ALLOCATOR
        .alloc_frame()
        .map_err(|_| VmInitError::NoFrames)?;
    unsafe {
        zero_table(root);

        let rwx = PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC | PteFlags::GLOBAL;
        map_identity_2m(root, RAM_BASE, RAM_SIZE, rwx)?;

        // One device page covers the whole control block.
        map_page(
            root,
            crate::mmio::CTRL_BASE,
            PhysAddr::new(crate::mmio::CTRL_BASE),
            PteFlags::READ | PteFlags::WRITE | PteFlags::GLOBAL,
        )?;

        crate::arch::lattice::enable_translation(root);
    }
    VM_ROOT.call_once(|| root);

    Ok(VmToken::new())
}

/// Map one page into the live kernel address space.
#[cfg(target_arch = "riscv64")]
pub fn map_kernel_page(va: usize, pa: PhysAddr, flags: PteFlags) -> Result<(), MapError> {
    let root = *VM_ROOT.get().ok_or(MapError::Uninitialized)?;
    unsafe {
        map_page(root, va, pa, flags)?;
        crate::arch::lattice::flush_page(va);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction_per_level() {
        // VA split: | 9 bits | 9 bits | 9 bits | 12 bits |
        let va = (3usize << 30) | (5 << 21) | (7 << 12);
        assert_eq!(table_index(va, 2), 3);
        assert_eq!(table_index(va, 1), 5);
        assert_eq!(table_index(va, 0), 7);
    }

    #[test]
    fn pte_round_trips_target_and_flags() {
        let flags = PteFlags::VALID | PteFlags::READ | PteFlags::WRITE;
        let pte = Pte::new(PhysAddr::new(0x8020_3000), flags);
        assert!(pte.is_valid());
        assert!(pte.is_leaf());
        assert_eq!(pte.target(), PhysAddr::new(0x8020_3000));
        assert_eq!(pte.flags(), flags);
    }

    #[test]
    fn pointer_entry_is_not_a_leaf() {
        let pte = Pte::new(PhysAddr::new(0x8000_0000), PteFlags::VALID);
        assert!(pte.is_valid());
        assert!(!pte.is_leaf());
    }

    #[test]
    fn empty_entry_is_invalid() {
        assert!(!Pte::EMPTY.is_valid());
    }
}
