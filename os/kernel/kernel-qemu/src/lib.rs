//! # QEMU Debug Console
//!
//! Byte-wise output to QEMU's `isa-debugcon` port (`0x402`) for the Ion test
//! kernel. Nothing here needs the heap, so it works from the first
//! instruction of `ion_main` on.
//!
//! ```text
//! log::info!  ──▶ QemuLogger ─┐
//!                             ├──▶ DebugCon (fmt::Write) ──▶ out 0x402
//! qemu_trace! ────────────────┘
//! ```
//!
//! Capture the output on the host with `-debugcon stdio` (or
//! `-debugcon file:ion.log`).
//!
//! With the `enabled` feature off, [`qemu_trace!`] and the logger compile to
//! nothing, which is also what happens on hosts that are not bare-metal
//! x86-64 so the crate can be unit tested.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    pub const DEBUGCON_PORT: u16 = 0x402;

    /// Writes straight to the debug console.
    pub struct DebugCon;

    impl Write for DebugCon {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                putc(b);
            }
            Ok(())
        }
    }

    #[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn putc(byte: u8) {
        // SAFETY: writing the debug console port has no side effects beyond
        // emitting the byte; on hardware without the device it is ignored.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") DEBUGCON_PORT,
                in("al") byte,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(all(feature = "enabled", target_arch = "x86_64", target_os = "none")))]
    #[inline]
    const fn putc(_: u8) {}

    /// Best effort; formatting errors are dropped.
    #[inline]
    pub fn qemu_write(args: fmt::Arguments<'_>) {
        let _ = DebugCon.write_fmt(args);
    }
}

/// `print!` to the QEMU debug console, without a trailing newline.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
