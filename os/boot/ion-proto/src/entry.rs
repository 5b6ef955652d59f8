//! # Kernel Entry Contract
//!
//! The bootloader transfers control exactly once, to [`ENTRY_SYMBOL`], with a
//! single argument: the address of the [`BootInfo`] record. At that instant
//! interrupts are disabled, `rsp` equals the stack top requested in the boot
//! header, and the active page tables realise exactly the negotiated mapping.
//!
//! No return is defined. The kernel side is modelled as a small state machine
//! that starts in [`EntryState::Entered`] and ends in the terminal
//! [`EntryState::Halted`], after which the core only ever waits for
//! interrupts that will not be delivered.

use crate::info::BootInfo;

/// Name of the kernel function the bootloader jumps to.
pub const ENTRY_SYMBOL: &str = "ion_main";

/// Kernel entry function pointer.
///
/// # ABI
/// System V AMD64: the record pointer arrives in `rdi`. The bootloader side
/// calls it through this type, so both halves agree on the convention
/// regardless of the bootloader's own (PE/COFF) default.
pub type KernelEntryFn = extern "sysv64" fn(*const BootInfo) -> !;

/// The two core operations the entry contract relies on.
pub trait Core {
    /// Mask maskable interrupts on the current core.
    fn disable_interrupts(&self);

    /// Park the core until the next interrupt (`hlt`).
    fn wait_for_interrupt(&self);
}

/// Lifecycle of the kernel entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryState {
    /// Control was just transferred; nothing has run yet.
    Entered,
    /// Kernel logic is executing.
    Running,
    /// Terminal. Interrupts are disabled and the core is parked.
    Halted,
}

impl EntryState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Halted)
    }
}

/// Rejected state transition.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: EntryState,
    pub to: EntryState,
}

/// Drives one core through the entry lifecycle.
pub struct EntryMachine<'c, C: Core + ?Sized> {
    core: &'c C,
    state: EntryState,
}

impl<'c, C: Core + ?Sized> EntryMachine<'c, C> {
    #[must_use]
    pub const fn new(core: &'c C) -> Self {
        Self {
            core,
            state: EntryState::Entered,
        }
    }

    #[must_use]
    pub const fn state(&self) -> EntryState {
        self.state
    }

    /// `Entered` → `Running`.
    ///
    /// # Errors
    /// Any other starting state is rejected and left unchanged.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            EntryState::Entered => {
                self.state = EntryState::Running;
                Ok(())
            }
            from => Err(InvalidTransition {
                from,
                to: EntryState::Running,
            }),
        }
    }

    /// Move to `Halted`, disabling interrupts on the way in.
    ///
    /// Once halted, further calls change nothing.
    pub fn finish(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.core.disable_interrupts();
        self.state = EntryState::Halted;
    }

    /// Run `body` to completion and park the core for good.
    pub fn run<F: FnOnce()>(mut self, body: F) -> ! {
        if self.start().is_ok() {
            body();
        }
        self.finish();
        park(self.core)
    }
}

/// Disable interrupts and wait forever.
pub fn halt<C: Core + ?Sized>(core: &C) -> ! {
    core.disable_interrupts();
    park(core)
}

fn park<C: Core + ?Sized>(core: &C) -> ! {
    loop {
        core.wait_for_interrupt();
    }
}
