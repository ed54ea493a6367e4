/// Boot controller: the primary thread's one-shot bring-up sequence.
///
/// Thread 0 is the only thread running at reset. It brings the address space
/// up, proves the page-backed allocator round-trips a value, and only then
/// releases the remaining hardware threads. The sequence never returns:
/// every path, success or fatal, ends with the thread parked forever.
use core::fmt;
use core::ptr::NonNull;

/// Recorded mock machine for host-target tests.
pub mod mock_hw;

#[cfg(test)]
mod tests;

use crate::kprintln;
use crate::mem::vm::VmToken;
use crate::thread::{Idle, ParkMode, ThreadContext, ThreadMask};

/// Sentinel pattern for the allocator smoke test.
pub const TEST_PATTERN: u32 = 0xABCD_EF12;

/// What the boot sequence needs from the machine.
///
/// The kernel entry implements this over the real vm/heap/resume-register
/// stack; host-target tests implement it over recorded state, the same way
/// the storage-style mock devices stand in for hardware elsewhere.
pub trait BootHardware {
    /// One-shot virtual-memory bring-up. Mapped memory access is legal only
    /// after this returns successfully.
    fn vm_init(&mut self) -> Result<VmToken, BootError>;

    /// One page of writable mapped memory.
    fn alloc_page(&mut self, vm: &VmToken) -> Result<NonNull<u8>, BootError>;

    /// Let every thread named in `mask` begin fetching from the shared
    /// entry. Fire-and-forget; the token proves the address space is built.
    fn release_threads(&mut self, vm: &VmToken, mask: ThreadMask);
}

/// Boot-fatal conditions. There is no caller above the entry path, so none
/// of these propagate anywhere: they are logged and the thread parks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// The virtual-memory subsystem could not be brought up.
    VmInit,
    /// The heap could not satisfy the one-page smoke-test request.
    NoMemory,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::VmInit => write!(f, "virtual memory init failed"),
            BootError::NoMemory => write!(f, "out of memory"),
        }
    }
}

/// Integrator-chosen handling for boot-fatal conditions.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// How the boot thread parks after a fatal failure.
    pub on_fatal: ParkMode,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            on_fatal: ParkMode::Wait,
        }
    }
}

/// Run the bring-up sequence on the primary thread.
///
/// Ordering contract: the release in the final step happens only after
/// `vm_init` has returned; `release_threads` cannot even be called without
/// the token it produced. No stronger ordering is promised to released
/// threads, the smoke test merely happens to precede the release here.
pub fn run<H: BootHardware>(hw: &mut H, ctx: ThreadContext, config: BootConfig) -> Idle {
    let vm = match hw.vm_init() {
        Ok(vm) => vm,
        Err(err) => return fatal(ctx, config, err),
    };

    kprintln!("Hello kernel land");

    let block = match hw.alloc_page(&vm) {
        Ok(block) => block,
        Err(err) => return fatal(ctx, config, err),
    };

    // Round-trip one word through the freshly mapped page. A mismatch shows
    // up in the diagnostic stream; it is not fatal.
    let word = block.cast::<u32>();
    unsafe { word.as_ptr().write_volatile(TEST_PATTERN) };
    let readback = unsafe { word.as_ptr().read_volatile() };
    kprintln!("{:08x}", readback);

    hw.release_threads(&vm, ThreadMask::ALL);

    ctx.park(ParkMode::Spin)
}

fn fatal(ctx: ThreadContext, config: BootConfig, err: BootError) -> Idle {
    kprintln!("boot: fatal: {}", err);
    ctx.park(config.on_fatal)
}
