//! # Kernel Link Layout
//!
//! Fixes where a kernel lives in the higher half and how its sections are
//! grouped into segments:
//!
//! ```text
//! KERNEL_BASE ┌──────────┐
//!             │   null   │ PT_NULL, no permissions, never mapped
//!             ├──────────┤ + padding page
//!             │   text   │ R+X    .text
//!             ├──────────┤ + padding page
//!             │  rodata  │ R      .ionhdr .rodata
//!             ├──────────┤ + padding page
//!             │   data   │ R+W    .data .bss
//!             └──────────┘
//! ```
//!
//! The same rules are applied three times: when [`plan`]ning addresses for a
//! set of compiled sections, when [`LinkerScript::render`]ing the script the
//! kernel is linked with (as `ASSERT`s, so a violation fails the link), and
//! when [`verify_elf`] checks a finished kernel before it is packaged.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod plan;
mod script;
mod verify;

pub use plan::{CompiledSection, Segment, SegmentTable, plan};
pub use script::LinkerScript;
pub use verify::verify_elf;

use alloc::string::String;
use ion_elf::{ElfError, PFlags, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE};
use ion_proto::memory;

/// Address space parameters the layout is computed for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LayoutConfig {
    /// Virtual address of the null segment; the kernel follows it.
    pub kernel_base: u64,
    /// Physical address the image is loaded at (`AT()` in the script).
    pub phys_load: u64,
    pub page_size: u64,
    /// Section that holds the boot header.
    pub header_section: &'static str,
    /// Symbol the bootloader jumps to.
    pub entry_symbol: &'static str,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self::ion()
    }
}

impl LayoutConfig {
    /// The layout described by [`ion_proto::memory`].
    #[must_use]
    pub const fn ion() -> Self {
        Self {
            kernel_base: memory::KERNEL_BASE,
            phys_load: memory::PHYS_LOAD,
            page_size: memory::PAGE_SIZE,
            header_section: ion_proto::header::HEADER_SECTION,
            entry_symbol: ion_proto::entry::ENTRY_SYMBOL,
        }
    }

    /// Sanity checks; build scripts call this first and fail fast.
    ///
    /// # Errors
    /// The base must be canonical higher half and 2 MiB aligned, the page
    /// size a power of two and the load address page aligned.
    pub const fn validate(&self) -> Result<(), LayoutError> {
        if !self.page_size.is_power_of_two() {
            return Err(LayoutError::PageSize(self.page_size));
        }
        if !memory::is_higher_half(self.kernel_base) {
            return Err(LayoutError::LowerHalfBase(self.kernel_base));
        }
        if !self.kernel_base.is_multiple_of(2 * 1024 * 1024) {
            return Err(LayoutError::MisalignedBase(self.kernel_base));
        }
        if !self.phys_load.is_multiple_of(self.page_size) {
            return Err(LayoutError::MisalignedPhysLoad(self.phys_load));
        }
        Ok(())
    }
}

/// The four segment kinds, in address order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PermissionClass {
    Null,
    ExecuteRead,
    ReadOnly,
    ReadWrite,
}

impl PermissionClass {
    pub const LOADED: [Self; 3] = [Self::ExecuteRead, Self::ReadOnly, Self::ReadWrite];

    /// Name of the `PHDRS` entry.
    #[must_use]
    pub const fn segment_name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::ExecuteRead => "text",
            Self::ReadOnly => "rodata",
            Self::ReadWrite => "data",
        }
    }

    #[must_use]
    pub const fn pflags(self) -> PFlags {
        match self {
            Self::Null => PFlags::new(),
            Self::ExecuteRead => PFlags::RX,
            Self::ReadOnly => PFlags::R,
            Self::ReadWrite => PFlags::RW,
        }
    }

    /// Class of a loaded segment's flags. Writable+executable fits none.
    #[must_use]
    pub const fn of_pflags(flags: PFlags) -> Option<Self> {
        match (flags.read(), flags.write(), flags.execute()) {
            (false, false, false) => Some(Self::Null),
            (true, false, true) => Some(Self::ExecuteRead),
            (true, false, false) => Some(Self::ReadOnly),
            (true, true, false) => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// Class of an allocated section. `None` for writable+executable
    /// sections; sections without `SHF_ALLOC` are not loaded at all and are
    /// reported as `Some(Null)`.
    #[must_use]
    pub const fn of_section(sh_flags: u64) -> Option<Self> {
        if sh_flags & SHF_ALLOC == 0 {
            return Some(Self::Null);
        }
        match (sh_flags & SHF_WRITE != 0, sh_flags & SHF_EXECINSTR != 0) {
            (false, true) => Some(Self::ExecuteRead),
            (false, false) => Some(Self::ReadOnly),
            (true, false) => Some(Self::ReadWrite),
            (true, true) => None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("Page size {0:#x} is not a power of two")]
    PageSize(u64),
    #[error("Kernel base {0:#x} is not in the canonical higher half")]
    LowerHalfBase(u64),
    #[error("Kernel base {0:#x} is not 2 MiB aligned")]
    MisalignedBase(u64),
    #[error("Physical load address {0:#x} is not page aligned")]
    MisalignedPhysLoad(u64),
    #[error("Retained section {0} is missing")]
    MissingSection(&'static str),
    #[error("Boot header section is {size} bytes, expected {expected}")]
    HeaderSize { size: u64, expected: usize },
    #[error("Section {name} belongs in the {expected:?} segment")]
    SectionPlacement {
        name: String,
        expected: PermissionClass,
    },
    #[error("Section {0} is both writable and executable")]
    Unclassified(String),
    #[error("Segment at {vaddr:#x} has flags {flags:#x} that fit no permission class")]
    UnclassifiedSegment { vaddr: u64, flags: u32 },
    #[error("Expected the null segment first")]
    NullSegment,
    #[error("Expected exactly one {class:?} segment, found {count}")]
    SegmentCount { class: PermissionClass, count: usize },
    #[error("Segment {0} is out of order")]
    OutOfOrder(&'static str),
    #[error("Segment {name} starts at {start:#x}, which is not page aligned")]
    Misaligned { name: &'static str, start: u64 },
    #[error("Segment {name} at {start:#x} is not in the higher half")]
    LowerHalf { name: &'static str, start: u64 },
    #[error("Segments {first} and {second} overlap")]
    Overlap {
        first: &'static str,
        second: &'static str,
    },
    #[error("Segments {first} and {second} are not separated by a padding page")]
    Padding {
        first: &'static str,
        second: &'static str,
    },
    #[error("Entry point {0:#x} is not inside the text segment")]
    EntryOutsideText(u64),
    #[error("Entry point {entry:#x} does not match symbol {symbol} at {value:#x}")]
    EntryMismatch {
        entry: u64,
        symbol: &'static str,
        value: u64,
    },
    #[error("Symbol table does not contain {0}")]
    MissingEntrySymbol(&'static str),
    #[error("Kernel has ELF type {0}; only static executables (ET_EXEC) are loaded")]
    NotExecutable(u16),
    #[error("Section {0} holds load-time relocations the bootloader does not apply")]
    DynamicRelocations(String),
    #[error("Layout exceeds the address space")]
    Overflow,
    #[error(transparent)]
    Elf(#[from] ElfError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ion_layout_is_valid() {
        LayoutConfig::ion().validate().unwrap();
    }

    #[test]
    fn rejects_bad_configs() {
        let ok = LayoutConfig::ion();
        assert_eq!(
            LayoutConfig { page_size: 3000, ..ok }.validate(),
            Err(LayoutError::PageSize(3000))
        );
        assert_eq!(
            LayoutConfig { kernel_base: 0x20_0000, ..ok }.validate(),
            Err(LayoutError::LowerHalfBase(0x20_0000))
        );
        assert_eq!(
            LayoutConfig { kernel_base: ok.kernel_base + 0x1000, ..ok }.validate(),
            Err(LayoutError::MisalignedBase(ok.kernel_base + 0x1000))
        );
        assert_eq!(
            LayoutConfig { phys_load: 0x20_0010, ..ok }.validate(),
            Err(LayoutError::MisalignedPhysLoad(0x20_0010))
        );
    }

    #[test]
    fn classifies_flags() {
        assert_eq!(PermissionClass::of_pflags(PFlags::RX), Some(PermissionClass::ExecuteRead));
        assert_eq!(PermissionClass::of_pflags(PFlags::R), Some(PermissionClass::ReadOnly));
        assert_eq!(PermissionClass::of_pflags(PFlags::RW), Some(PermissionClass::ReadWrite));
        assert_eq!(PermissionClass::of_pflags(PFlags::RWX), None);

        assert_eq!(
            PermissionClass::of_section(SHF_ALLOC | SHF_EXECINSTR),
            Some(PermissionClass::ExecuteRead)
        );
        assert_eq!(
            PermissionClass::of_section(SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR),
            None
        );
        assert_eq!(PermissionClass::of_section(0), Some(PermissionClass::Null));
    }
}
