//! LatticeOS kernel entry point.
//!
//! The lattice core releases hardware thread 0 at reset; the remaining
//! threads stay halted until the boot sequence writes the thread resume
//! register. All of them enter through the shared reset vector in
//! `arch/lattice/boot.S`, which lands thread 0 in `kmain` and every
//! released thread in `worker_start`.
//!
//! Build for the kernel target with:
//!   cargo build --target riscv64gc-unknown-none-elf
#![cfg_attr(target_arch = "riscv64", no_std, no_main)]

#[cfg(target_arch = "riscv64")]
mod entry {
    use core::panic::PanicInfo;
    use core::ptr::NonNull;

    use latticeos_kernel::arch::lattice::{self, ControlReg};
    use latticeos_kernel::boot::{self, BootConfig, BootError, BootHardware};
    use latticeos_kernel::console::CONSOLE;
    use latticeos_kernel::kprintln;
    use latticeos_kernel::mem::{heap, phys, vm};
    use latticeos_kernel::thread::{self, ThreadContext, ThreadMask, THREAD_ENABLE};

    extern "C" {
        /// First byte past the kernel image; placed by the linker script.
        static __kernel_end: u8;
    }

    /// Pages mapped for the kernel heap window at bring-up.
    const HEAP_PAGES: usize = 256;
    /// Virtual base of the heap window, outside the identity-mapped RAM.
    const HEAP_BASE: usize = 0xC000_0000;

    /// The real machine behind the boot sequence.
    struct LatticeHardware;

    impl BootHardware for LatticeHardware {
        fn vm_init(&mut self) -> Result<vm::VmToken, BootError> {
            let token = vm::init().map_err(|err| {
                kprintln!("[vm] {}", err);
                BootError::VmInit
            })?;
            kprintln!("[vm] translation enabled");

            // With translation live, back the heap window with fresh pages.
            if let Err(err) = map_heap_window() {
                kprintln!("[mem] {}", err);
                return Err(BootError::VmInit);
            }
            kprintln!(
                "[mem] heap window: {} KiB at {:#x}",
                heap::HEAP.free_bytes() / 1024,
                HEAP_BASE
            );

            Ok(token)
        }

        fn alloc_page(&mut self, _vm: &vm::VmToken) -> Result<NonNull<u8>, BootError> {
            heap::kmalloc(phys::PAGE_SIZE).map_err(|err| {
                kprintln!("[mem] {}", err);
                BootError::NoMemory
            })
        }

        fn release_threads(&mut self, vm: &vm::VmToken, mask: ThreadMask) {
            kprintln!("[smp] releasing all hardware threads");
            THREAD_ENABLE.release(vm, mask);
        }
    }

    /// Map `HEAP_PAGES` fresh frames at the heap window and hand the region
    /// to the allocator.
    fn map_heap_window() -> Result<(), vm::MapError> {
        let flags = vm::PteFlags::READ | vm::PteFlags::WRITE | vm::PteFlags::GLOBAL;
        for page in 0..HEAP_PAGES {
            let frame = phys::FRAME_ALLOCATOR.alloc_frame()?;
            vm::map_kernel_page(HEAP_BASE + page * phys::PAGE_SIZE, frame, flags)?;
        }
        unsafe { heap::HEAP.init(HEAP_BASE, HEAP_PAGES * phys::PAGE_SIZE) };
        Ok(())
    }

    /// Boot sequence for hardware thread 0.
    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        CONSOLE.lock().init();
        kprintln!("LatticeOS v0.1.0 booting on thread 0");

        // The frame allocator owns RAM above the kernel image (the boot
        // stacks live inside the image's bss).
        let image_end = unsafe { core::ptr::addr_of!(__kernel_end) as usize };
        let frames_base =
            (image_end + phys::PAGE_SIZE - 1) & !(phys::PAGE_SIZE - 1);
        phys::FRAME_ALLOCATOR.init(
            frames_base,
            phys::RAM_BASE + phys::RAM_SIZE - frames_base,
        );
        kprintln!("[mem] {} frames free", phys::FRAME_ALLOCATOR.free_count());

        let idle = boot::run(
            &mut LatticeHardware,
            ThreadContext::primary(),
            BootConfig::default(),
        );
        lattice::park_forever(idle)
    }

    /// Shared entry for every thread the resume register releases.
    #[no_mangle]
    pub extern "C" fn worker_start() -> ! {
        let id = lattice::read_control_reg(ControlReg::ThreadId) as u32;
        let idle = thread::worker_entry(ThreadContext::worker(id));
        lattice::park_forever(idle)
    }

    /// Manual diagnostic aid: store through an address no mapping covers to
    /// force a hardware fault on demand. Never called on a normal boot.
    #[allow(dead_code)]
    fn fault_probe() {
        unsafe { (1 as *mut u32).write_volatile(1) };
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        kprintln!("!!! KERNEL PANIC !!!");
        kprintln!("{}", info);
        loop {
            lattice::wait();
        }
    }
}

/// The kernel image only means something on the lattice target; building for
/// the host just produces this stub so the workspace compiles everywhere.
#[cfg(not(target_arch = "riscv64"))]
fn main() {}
