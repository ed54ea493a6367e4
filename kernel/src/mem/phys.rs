/// Physical page-frame allocator, a bitmap over the fixed RAM window.
///
/// The lattice core carries one contiguous bank of RAM at `RAM_BASE`. Frames
/// are tracked relative to the window handed to `init` (the boot path carves
/// out the kernel image and boot stacks before calling it). Page tables take
/// single frames; the kernel heap window takes a contiguous run.
use core::fmt;
use spin::Mutex;
use static_assertions::const_assert;

pub const PAGE_SIZE: usize = 4096;

/// Start of RAM on the lattice core.
pub const RAM_BASE: usize = 0x8000_0000;
/// Fixed RAM bank size: 128 MiB.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;

const MAX_FRAMES: usize = RAM_SIZE / PAGE_SIZE;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

const_assert!(RAM_SIZE % PAGE_SIZE == 0);
const_assert!(MAX_FRAMES % 64 == 0);

/// A physical address. Transparent wrapper for clarity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocError {
    OutOfFrames,
    InvalidSize,
    Uninitialized,
}

impl fmt::Display for FrameAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameAllocError::OutOfFrames => write!(f, "out of physical frames"),
            FrameAllocError::InvalidSize => write!(f, "invalid frame count"),
            FrameAllocError::Uninitialized => write!(f, "frame allocator not initialized"),
        }
    }
}

pub struct FrameAllocator {
    inner: Mutex<FrameInner>,
}

struct FrameInner {
    /// 1 = used. Starts all-ones; `init` frees the usable window.
    bitmap: [u64; BITMAP_WORDS],
    base: usize,
    frames: usize,
    free: usize,
}

impl FrameInner {
    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set_used(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1 << (frame % 64);
    }

    fn set_free(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(FrameInner {
                bitmap: [u64::MAX; BITMAP_WORDS],
                base: 0,
                frames: 0,
                free: 0,
            }),
        }
    }

    /// Hand the allocator its RAM window. `base .. base + len` must be
    /// ordinary memory not otherwise in use.
    pub fn init(&self, base: usize, len: usize) {
        let mut inner = self.inner.lock();
        inner.base = base;
        inner.frames = (len / PAGE_SIZE).min(MAX_FRAMES);
        for frame in 0..inner.frames {
            inner.set_free(frame);
        }
        inner.free = inner.frames;
    }

    /// Allocate a single frame.
    pub fn alloc_frame(&self) -> Result<PhysAddr, FrameAllocError> {
        self.alloc_contiguous(1)
    }

    /// Allocate `count` physically contiguous frames, first fit.
    pub fn alloc_contiguous(&self, count: usize) -> Result<PhysAddr, FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::InvalidSize);
        }

        let mut inner = self.inner.lock();
        if inner.frames == 0 {
            return Err(FrameAllocError::Uninitialized);
        }
        if inner.free < count {
            return Err(FrameAllocError::OutOfFrames);
        }

        let mut run = 0usize;
        let mut start = 0usize;
        for frame in 0..inner.frames {
            if inner.is_used(frame) {
                run = 0;
                continue;
            }
            if run == 0 {
                start = frame;
            }
            run += 1;
            if run == count {
                for taken in start..start + count {
                    inner.set_used(taken);
                }
                inner.free -= count;
                return Ok(PhysAddr::new(inner.base + start * PAGE_SIZE));
            }
        }

        Err(FrameAllocError::OutOfFrames)
    }

    /// Return `count` frames starting at `base`. Frames that are already
    /// free are skipped, so a double free cannot corrupt the counters.
    pub fn free_frames(&self, base: PhysAddr, count: usize) {
        let mut inner = self.inner.lock();
        if base.as_usize() < inner.base {
            return;
        }
        let start = (base.as_usize() - inner.base) / PAGE_SIZE;
        for frame in start..(start + count).min(inner.frames) {
            if inner.is_used(frame) {
                inner.set_free(frame);
                inner.free += 1;
            }
        }
    }

    /// Number of free frames remaining.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free
    }

    /// Frames covered by the window handed to `init`.
    pub fn frame_count(&self) -> usize {
        self.inner.lock().frames
    }
}

/// Global frame allocator instance.
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(frames: usize) -> FrameAllocator {
        let alloc = FrameAllocator::new();
        alloc.init(RAM_BASE, frames * PAGE_SIZE);
        alloc
    }

    #[test]
    fn alloc_before_init_fails() {
        let alloc = FrameAllocator::new();
        assert_eq!(alloc.alloc_frame(), Err(FrameAllocError::Uninitialized));
    }

    #[test]
    fn frames_come_back_in_order() {
        let alloc = fresh(16);
        assert_eq!(alloc.alloc_frame().unwrap(), PhysAddr::new(RAM_BASE));
        assert_eq!(
            alloc.alloc_frame().unwrap(),
            PhysAddr::new(RAM_BASE + PAGE_SIZE)
        );
        assert_eq!(alloc.free_count(), 14);
    }

    #[test]
    fn contiguous_run_skips_gaps() {
        let alloc = fresh(16);
        let a = alloc.alloc_contiguous(4).unwrap();
        let _b = alloc.alloc_contiguous(4).unwrap();
        alloc.free_frames(a, 4);

        // 4 free, 4 used, 8 free: a run of 8 must land past the used block.
        let c = alloc.alloc_contiguous(8).unwrap();
        assert_eq!(c, PhysAddr::new(RAM_BASE + 8 * PAGE_SIZE));
    }

    #[test]
    fn free_is_idempotent() {
        let alloc = fresh(8);
        let a = alloc.alloc_contiguous(4).unwrap();
        alloc.free_frames(a, 4);
        alloc.free_frames(a, 4);
        assert_eq!(alloc.free_count(), 8);
    }

    #[test]
    fn exhaustion_reports_out_of_frames() {
        let alloc = fresh(4);
        let _ = alloc.alloc_contiguous(4).unwrap();
        assert_eq!(alloc.alloc_frame(), Err(FrameAllocError::OutOfFrames));
    }

    #[test]
    fn zero_count_is_invalid() {
        let alloc = fresh(4);
        assert_eq!(
            alloc.alloc_contiguous(0),
            Err(FrameAllocError::InvalidSize)
        );
    }
}
