/// Hardware-thread release and the worker entry.
///
/// The lattice core holds every thread but thread 0 halted at reset. The one
/// and only release mechanism is a bitmask write to the thread resume
/// register; released threads begin fetching at the shared reset vector.
/// There is no acknowledgment, no re-halt, and no incremental protocol: the
/// boot sequence enables everything at once.
use core::fmt;
use static_assertions::assert_eq_size;

use crate::mem::vm::VmToken;
use crate::mmio::{MmioReg, THREAD_RESUME};

/// Per-thread enable bitmask: bit `i` set means hardware thread `i` may
/// fetch and execute.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadMask(u32);

assert_eq_size!(ThreadMask, u32);

impl ThreadMask {
    /// Every thread the core can carry.
    pub const ALL: ThreadMask = ThreadMask(0xFFFF_FFFF);

    /// The mask naming exactly thread `id`. Ids at or above 32 name no
    /// hardware and produce the empty mask.
    pub const fn single(id: u32) -> ThreadMask {
        if id < 32 {
            ThreadMask(1 << id)
        } else {
            ThreadMask(0)
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, id: u32) -> bool {
        id < 32 && self.0 & (1 << id) != 0
    }
}

impl fmt::Debug for ThreadMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadMask({:#010x})", self.0)
    }
}

/// The write-only thread resume register.
///
/// Writing is fire-and-forget: no readback and no way to re-halt a thread
/// afterwards. `release` demands the VM token, so the requirement that
/// released threads never observe a half-built address space is a
/// compile-time obligation rather than a convention.
pub struct ThreadEnable {
    reg: MmioReg<u32>,
}

impl ThreadEnable {
    /// # Safety
    /// `addr` must be the thread resume register.
    pub const unsafe fn at(addr: usize) -> Self {
        Self {
            reg: MmioReg::new(addr),
        }
    }

    /// Let every thread named in `mask` begin fetching.
    pub fn release(&self, _vm: &VmToken, mask: ThreadMask) {
        self.reg.write(mask.bits());
    }
}

/// The resume register at its fixed lattice address.
pub static THREAD_ENABLE: ThreadEnable = unsafe { ThreadEnable::at(THREAD_RESUME) };

/// Execution state of one hardware thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Held by hardware; has never fetched an instruction.
    HaltedAtReset,
    /// Thread 0 running the boot sequence.
    RunningBoot,
    /// A released thread running the worker entry.
    RunningWorker,
    /// Terminal: the thread burns its slot forever and never transitions
    /// again.
    IdleForever,
}

/// How a parked thread burns its execution slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkMode {
    /// Pause on the wait-for-event instruction.
    Wait,
    /// Busy-spin.
    Spin,
}

/// Proof that a thread reached its terminal state. The only consumer is the
/// architectural park loop, which never returns.
#[must_use]
pub struct Idle {
    mode: ParkMode,
}

impl Idle {
    pub fn mode(&self) -> ParkMode {
        self.mode
    }
}

/// Software view of one hardware thread's lifecycle.
pub struct ThreadContext {
    id: u32,
    state: ThreadState,
}

impl ThreadContext {
    /// Thread 0, released implicitly at hardware reset.
    pub const fn primary() -> Self {
        Self {
            id: 0,
            state: ThreadState::RunningBoot,
        }
    }

    /// A worker thread still held at reset.
    pub const fn halted(id: u32) -> Self {
        Self {
            id,
            state: ThreadState::HaltedAtReset,
        }
    }

    /// A worker thread the hardware has just released into the entry point.
    pub fn worker(id: u32) -> Self {
        let mut ctx = Self::halted(id);
        let started = ctx.release();
        debug_assert!(started);
        ctx
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub const fn state(&self) -> ThreadState {
        self.state
    }

    /// Begin executing the worker entry. True exactly once per thread: the
    /// enable write cannot restart a running or parked thread.
    pub fn release(&mut self) -> bool {
        match self.state {
            ThreadState::HaltedAtReset => {
                self.state = ThreadState::RunningWorker;
                true
            }
            _ => false,
        }
    }

    /// Enter the terminal idle state. Consumes the context, so a transition
    /// out of `IdleForever` cannot even be written.
    pub fn park(mut self, mode: ParkMode) -> Idle {
        self.state = ThreadState::IdleForever;
        Idle { mode }
    }
}

/// The code every released hardware thread runs: emit the identification
/// value this thread observed in its control register, then park. Workers
/// never coordinate; output interleaving across threads is unspecified.
pub fn worker_entry(ctx: ThreadContext) -> Idle {
    crate::kprint!("{}", ctx.id());
    ctx.park(ParkMode::Spin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::vm::VmToken;
    use alloc::vec::Vec;

    #[test]
    fn all_mask_covers_every_thread() {
        for id in 0..32 {
            assert!(ThreadMask::ALL.contains(id));
        }
        assert_eq!(ThreadMask::ALL.bits(), 0xFFFF_FFFF);
    }

    #[test]
    fn single_mask_names_one_thread() {
        let mask = ThreadMask::single(5);
        assert!(mask.contains(5));
        assert!(!mask.contains(4));
        assert_eq!(ThreadMask::single(40).bits(), 0);
    }

    #[test]
    fn enable_register_writes_the_mask() {
        let mut cell: u32 = 0;
        let enable = unsafe { ThreadEnable::at(&mut cell as *mut u32 as usize) };
        enable.release(&VmToken::new(), ThreadMask::ALL);
        assert_eq!(cell, 0xFFFF_FFFF);
    }

    #[test]
    fn release_happens_exactly_once() {
        let mut ctx = ThreadContext::halted(3);
        assert_eq!(ctx.state(), ThreadState::HaltedAtReset);

        assert!(ctx.release());
        assert_eq!(ctx.state(), ThreadState::RunningWorker);

        assert!(!ctx.release());
        assert_eq!(ctx.state(), ThreadState::RunningWorker);
    }

    #[test]
    fn primary_thread_cannot_be_rereleased() {
        let mut ctx = ThreadContext::primary();
        assert_eq!(ctx.state(), ThreadState::RunningBoot);
        assert!(!ctx.release());
    }

    #[test]
    fn park_reports_the_requested_mode() {
        let idle = ThreadContext::worker(1).park(ParkMode::Wait);
        assert_eq!(idle.mode(), ParkMode::Wait);
    }

    #[test]
    fn release_fanout_starts_every_worker_once() {
        let mut workers: Vec<ThreadContext> = (1..8).map(ThreadContext::halted).collect();

        let started: usize = workers
            .iter_mut()
            .filter(|ctx| ThreadMask::ALL.contains(ctx.id()))
            .map(|ctx| ctx.release() as usize)
            .sum();
        assert_eq!(started, 7);
        assert!(workers
            .iter()
            .all(|ctx| ctx.state() == ThreadState::RunningWorker));

        // A second broadcast of the same mask starts nothing.
        let restarted: usize = workers.iter_mut().map(|ctx| ctx.release() as usize).sum();
        assert_eq!(restarted, 0);
    }
}
