/// Diagnostic console, the transmit-only UART in the control block.
///
/// Output goes through `kprint!` / `kprintln!`. The UART is addressed
/// physically inside the identity-mapped device page, so the console works
/// before and after translation is enabled.
///
/// The shared channel is serialized by the lock below; the hardware itself
/// promises no ordering between threads writing concurrently.
use core::fmt;
use spin::Mutex;

#[cfg(target_arch = "riscv64")]
use bitflags::bitflags;

#[cfg(target_arch = "riscv64")]
use crate::mmio::{MmioReg, UART_STATUS, UART_TX};

pub static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

#[cfg(target_arch = "riscv64")]
bitflags! {
    /// UART line status bits.
    #[derive(Clone, Copy, PartialEq, Eq)]
    struct UartStatus: u32 {
        /// Transmit holding register can take another byte.
        const TX_READY = 1 << 0;
        /// Transmitter shift register has drained completely.
        const TX_EMPTY = 1 << 1;
    }
}

#[cfg(target_arch = "riscv64")]
pub struct Console {
    status: MmioReg<u32>,
    tx: MmioReg<u32>,
}

#[cfg(target_arch = "riscv64")]
impl Console {
    const fn new() -> Self {
        Self {
            status: unsafe { MmioReg::new(UART_STATUS) },
            tx: unsafe { MmioReg::new(UART_TX) },
        }
    }

    /// Bring up the console. The lattice UART is fixed-function (no baud
    /// programming), so this just waits for any reset-time noise to drain.
    pub fn init(&self) {
        while !self.line_status().contains(UartStatus::TX_EMPTY) {
            core::hint::spin_loop();
        }
    }

    fn line_status(&self) -> UartStatus {
        UartStatus::from_bits_truncate(self.status.read())
    }

    /// Write a single byte, waiting for the transmitter.
    fn write_byte(&self, byte: u8) {
        while !self.line_status().contains(UartStatus::TX_READY) {
            core::hint::spin_loop();
        }
        self.tx.write(byte as u32);
    }

    fn write_str_raw(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

// --- Host-target console ---
// Off-target there is no UART; the console captures everything in memory so
// unit tests can assert the diagnostics a boot path emitted.

#[cfg(not(target_arch = "riscv64"))]
pub struct Console {
    captured: alloc::string::String,
}

#[cfg(not(target_arch = "riscv64"))]
impl Console {
    const fn new() -> Self {
        Self {
            captured: alloc::string::String::new(),
        }
    }

    pub fn init(&self) {}

    fn write_str_raw(&mut self, s: &str) {
        self.captured.push_str(s);
    }

    /// Drain everything captured so far.
    pub fn take(&mut self) -> alloc::string::String {
        core::mem::take(&mut self.captured)
    }
}

/// Drain the host console capture. Tests run concurrently against the one
/// global console, so callers should only ever assert on their own
/// substrings, never on exact buffer contents.
#[cfg(not(target_arch = "riscv64"))]
pub fn captured() -> alloc::string::String {
    CONSOLE.lock().take()
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str_raw(s);
        Ok(())
    }
}

/// Print to the diagnostic console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        {
            use core::fmt::Write;
            let mut console = $crate::console::CONSOLE.lock();
            let _ = write!(console, $($arg)*);
        }
    };
}

/// Print to the diagnostic console with a newline.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}

/// Serializes tests that drain the capture buffer, so one test cannot steal
/// another's output between its write and its assertion.
#[cfg(all(test, not(target_arch = "riscv64")))]
pub(crate) static OUT_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_records_formatted_output() {
        let _guard = OUT_LOCK.lock();
        let _ = captured();
        crate::kprintln!("console self test {:08x}", 0x1234_ABCDu32);
        let out = captured();
        assert!(out.contains("console self test 1234abcd"));
    }
}
