//! The running core.

use ion_proto::entry::Core;

/// The x86-64 core `ion_main` runs on.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Core;

#[cfg(target_arch = "x86_64")]
impl Core for X86Core {
    #[inline]
    fn disable_interrupts(&self) {
        // SAFETY: ring 0; masking interrupts has no memory effects.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) };
    }

    #[inline]
    fn wait_for_interrupt(&self) {
        // SAFETY: ring 0; with interrupts masked this only returns on NMI/SMI.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl Core for X86Core {
    fn disable_interrupts(&self) {}

    fn wait_for_interrupt(&self) {
        core::hint::spin_loop();
    }
}
