//! # Memory Layout

/// Size of the smallest page the layout is expressed in.
pub const PAGE_SIZE: u64 = 4096;

/// First canonical address of the higher half.
pub const HIGHER_HALF_START: u64 = 0xffff_8000_0000_0000;

/// One past the last canonical address of the lower half.
pub const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Higher Half Direct Map (HHDM) base.
///
/// When a kernel requests higher-half pointers, every physical address `pa`
/// handed over by the bootloader is expressed as `HHDM_BASE + pa`.
pub const HHDM_BASE: u64 = 0xffff_8000_0000_0000;

/// Where the kernel executes (VMA).
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to render the
/// linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the bootloader places the kernel bytes in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0020_0000; // 2 MiB

/// Size of the low identity map the bootloader keeps for its own transition code.
pub const IDENTITY_LOW_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Size of one reserved kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Number of kernel stacks reserved in `.bss`.
///
/// Only the first one is wired into the boot header; the remainder is held
/// back for per-core entry once secondary cores are brought up.
pub const KERNEL_STACKS: usize = 10;

/// Returns `true` if `addr` lies in the canonical higher half.
#[inline]
#[must_use]
pub const fn is_higher_half(addr: u64) -> bool {
    addr >= HIGHER_HALF_START
}

/// Returns `true` if `addr` lies in the canonical lower half.
#[inline]
#[must_use]
pub const fn is_lower_half(addr: u64) -> bool {
    addr < LOWER_HALF_END
}

/// Round `x` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    (x + (align - 1)) & !(align - 1)
}

/// [`align_up`], or `None` if the result does not fit in a `u64`.
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, align: u64) -> Option<u64> {
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `x` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(is_higher_half(HHDM_BASE));
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_BASE.is_multiple_of(2 * 1024 * 1024));
    assert!(PHYS_LOAD.is_multiple_of(PAGE_SIZE));
};
