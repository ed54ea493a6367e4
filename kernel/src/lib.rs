#![no_std]

extern crate alloc;

// The hardware layer compiles only for the lattice kernel target. Host-target
// unit tests (`cargo test --lib`) exercise the portable boot logic against the
// mock machine in `boot::mock_hw` and the capture-backed console instead.
#[cfg(target_arch = "riscv64")]
pub mod arch;

pub mod boot;
pub mod console;
pub mod mem;
pub mod mmio;
pub mod thread;
