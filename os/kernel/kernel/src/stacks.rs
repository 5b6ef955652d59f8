//! Statically reserved kernel stacks.
//!
//! The stacks live in `.bss`, so they cost nothing in the image and are
//! mapped read+write as part of the data segment. Only core 0's stack is
//! named in the boot header; the rest are reserved for application
//! processors.
//!
//! ```text
//! ┌──────────────┐ ← top_of(stacks, 0)   initial rsp
//! │   core 0     │
//! ├──────────────┤ ← top_of(stacks, 1)
//! │   core 1     │
//! │     …        │
//! └──────────────┘ ← stacks
//! ```
//!
//! Stacks grow down into the next lower stack; there are no guard pages
//! between them.

use ion_proto::memory::{KERNEL_STACK_SIZE, KERNEL_STACKS};

#[derive(Copy, Clone)]
#[repr(C, align(16))]
struct Stack([u8; KERNEL_STACK_SIZE]);

/// [`KERNEL_STACKS`] stacks of [`KERNEL_STACK_SIZE`] bytes each.
#[repr(C, align(16))]
pub struct KernelStacks([Stack; KERNEL_STACKS]);

impl Default for KernelStacks {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelStacks {
    #[must_use]
    pub const fn new() -> Self {
        Self([Stack([0; KERNEL_STACK_SIZE]); KERNEL_STACKS])
    }

    /// Initial stack pointer for `core`, 16-byte aligned. Stack 0 is the
    /// highest so it can be computed without knowing the core count.
    ///
    /// Usable in `static` initialisers; `core` wraps around modulo
    /// [`KERNEL_STACKS`].
    #[must_use]
    pub const fn top_of(stacks: *const Self, core: usize) -> *const u8 {
        let index = KERNEL_STACKS - core % KERNEL_STACKS;
        stacks.cast::<u8>().wrapping_add(index * KERNEL_STACK_SIZE)
    }
}

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(16));
    assert!(core::mem::size_of::<KernelStacks>() == KERNEL_STACK_SIZE * KERNEL_STACKS);
};
