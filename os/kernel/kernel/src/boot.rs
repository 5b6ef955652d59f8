//! Boot header, stacks and the entry point.

use core::ptr;
use ion_proto::entry::halt;
use ion_proto::header::{BootHeader, FramebufferTag, HeaderFlags, UnmapNullTag};
use ion_proto::info::{BootInfo, record_memory};
use kernel::cpu::X86Core;
use kernel::stacks::KernelStacks;
use kernel_qemu::{QemuLogger, qemu_trace};
use log::{LevelFilter, error};

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);

#[unsafe(link_section = ".bss.stacks")]
static mut STACKS: KernelStacks = KernelStacks::new();

static UNMAP_NULL: UnmapNullTag = UnmapNullTag::new();

/// Any mode the bootloader considers best.
static FRAMEBUFFER: FramebufferTag =
    FramebufferTag::new(0, 0, 0).next(ptr::from_ref(&UNMAP_NULL.tag));

/// The entry point is left null so the bootloader uses the ELF entry,
/// which the linker script sets to `ion_main`.
#[used]
#[unsafe(link_section = ".ionhdr")]
static ION_HEADER: BootHeader = BootHeader::new()
    .stack(KernelStacks::top_of(&raw const STACKS, 0))
    .flags(HeaderFlags::ALL)
    .tags(ptr::from_ref(&FRAMEBUFFER.tag));

/// Kernel entry.
///
/// # ABI
/// System V: `info` arrives in `rdi`. Interrupts are off and `rsp` is the
/// top of core 0's stack from [`ION_HEADER`].
#[unsafe(no_mangle)]
pub extern "sysv64" fn ion_main(info: *const BootInfo) -> ! {
    qemu_trace!("ion_main({info:p})\n");
    let _ = LOGGER.init();

    // SAFETY: the bootloader reserves the full record size at `info` and
    // leaves it untouched for the lifetime of the kernel.
    let mem = unsafe { record_memory(info) };
    kernel::run(&X86Core, &mem, info as u64)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    error!("{info}");
    halt(&X86Core)
}
