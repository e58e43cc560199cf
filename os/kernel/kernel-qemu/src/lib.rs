//! # QEMU Debug Console Output
//!
//! Logging for a kernel running under QEMU: every byte written to the debug
//! console I/O port (`0xE9`) shows up on the host.
//!
//! ```text
//! log::info!(..) ─► QemuLogger ─► qemu_trace! ─► QemuSink ─► out 0xE9 ─► -debugcon
//! ```
//!
//! ## Components
//!
//! * [`QemuLogger`]: a `log::Log` implementation formatting records as
//!   `[LEVEL] target: message`.
//! * [`qemu_trace!`]: direct `format!`-style output that bypasses `log`,
//!   usable before the logger is installed.
//!
//! ## `enabled` feature (default)
//!
//! Without it, every write compiles to a no-op; on the host (tests) the port
//! is never touched either way.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger already installed");
//! info!("paging enabled");
//! ```
//!
//! Capture the output on the host with
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.elf -debugcon stdio
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_record};

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's `-debugcon` port (the Bochs `0xE9` hack).
    pub const QEMU_DEBUG_PORT: u16 = 0xE9;

    /// Write a single byte to the debug console.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(all(any(target_arch = "x86", target_arch = "x86_64"), target_os = "none")))]
        let _ = c;
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the sink itself never fails.
        let _ = QemuSink.write_fmt(args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// Write `format!`-style output straight to the debug console.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
