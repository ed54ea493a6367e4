/// Lattice core primitives: control registers, translation enable, the
/// shared reset vector, and the terminal park loops.
use core::arch::{asm, global_asm};

use crate::mem::phys::PhysAddr;
use crate::thread::{Idle, ParkMode};

global_asm!(include_str!("boot.S"));

/// Processor-internal control registers, read with a dedicated register
/// instruction rather than a memory load. The index is architectural; the
/// virtual-memory subsystem never sees these reads.
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub enum ControlReg {
    /// Identity of the executing hardware thread.
    ThreadId = 0,
}

/// Read a control register on the executing thread.
#[inline]
pub fn read_control_reg(which: ControlReg) -> u64 {
    let value: u64;
    match which {
        ControlReg::ThreadId => unsafe {
            asm!("csrr {0}, mhartid", out(reg) value, options(nostack, nomem));
        },
    }
    value
}

/// Point translation at `root` and switch it on.
///
/// # Safety
/// `root` must be a fully built root table whose mappings cover every
/// address the kernel touches from the next instruction onward.
pub unsafe fn enable_translation(root: PhysAddr) {
    // Mode 8: three levels, 4 KiB pages.
    let mode = (8u64 << 60) | (root.as_usize() as u64 >> 12);
    asm!(
        "csrw satp, {0}",
        "sfence.vma zero, zero",
        in(reg) mode,
        options(nostack),
    );
}

/// Drop a stale translation for one page.
///
/// # Safety
/// Callers must not rely on the old mapping after this returns.
#[inline]
pub unsafe fn flush_page(va: usize) {
    asm!("sfence.vma {0}, zero", in(reg) va, options(nostack));
}

/// Pause until the next event.
#[inline]
pub fn wait() {
    unsafe { asm!("wfi", options(nostack, nomem)) };
}

/// Burn this thread's execution slot forever. Only reachable with the
/// terminal-state proof from `ThreadContext::park`.
pub fn park_forever(idle: Idle) -> ! {
    match idle.mode() {
        ParkMode::Wait => loop {
            wait();
        },
        ParkMode::Spin => loop {
            core::hint::spin_loop();
        },
    }
}
