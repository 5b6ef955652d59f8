//! # Ion Bootloader Protocol Logic
//!
//! Everything the bootloader decides between "the kernel file is in memory"
//! and "jump": it finds and decodes the kernel's boot header, walks the
//! request tags, picks a video mode, plans the page mappings and encodes the
//! handoff record. None of it touches firmware, so it runs (and is tested) on
//! the host; the UEFI executable only feeds it the kernel bytes, the
//! available video modes and the memory map, then carries out the plan.
//!
//! ```text
//! kernel bytes ──▶ KernelImage::parse ──▶ negotiate ──▶ Negotiated
//!                                              │
//!            video modes ──▶ select_framebuffer┤
//!                                              ▼
//!                         MappingPlan::build   HandoffBuilder::encode
//!                                  │                  │
//!                                  └──▶ EntryContext ◀┘
//! ```
//!
//! [`prepare`] runs the whole sequence.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod config;
pub mod handoff;
pub mod image;
pub mod mapping;
pub mod negotiate;
mod prepare;

pub use handoff::{Addressing, EntryContext, HandoffBuilder, entry_context};
pub use image::KernelImage;
pub use mapping::{Mapping, MappingKind, MappingPlan};
pub use negotiate::{Negotiated, TagWalker, VideoMode, negotiate, select_framebuffer};
pub use prepare::{BootEnvironment, BootPlan, prepare};

use alloc::string::String;
use ion_elf::ElfError;
use ion_proto::list::ListError;

/// Header tag lists longer than this are rejected.
pub const MAX_HEADER_TAGS: usize = ion_proto::list::MAX_TAGS;

/// Everything that stops the bootloader before control transfer.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum NegotiationError {
    #[error("Kernel is not a usable ELF64 image")]
    Elf(#[from] ElfError),
    #[error("Kernel has ELF type {0}; only static executables (ET_EXEC) are loaded")]
    NotExecutable(u16),
    #[error("Kernel section {0} needs load-time relocations, which are not applied")]
    DynamicRelocations(String),
    #[error("Kernel has no {0} section")]
    MissingHeader(&'static str),
    #[error("Boot header section is {size} bytes, expected {expected}")]
    HeaderSize { size: u64, expected: usize },
    #[error("Malformed header tag list")]
    TagList(#[from] ListError),
    #[error("Unknown request flags {0:#x}")]
    UnknownFlags(u64),
    #[error("Requested stack pointer is null")]
    NullStack,
    #[error("Requested stack pointer {0:#x} is not 16-byte aligned")]
    MisalignedStack(u64),
    #[error("Requested stack pointer {0:#x} is not inside a writable segment")]
    StackNotWritable(u64),
    #[error("Entry point {0:#x} is not inside an executable segment")]
    EntryNotExecutable(u64),
    #[error("Segment at {0:#x} is not in the kernel window")]
    SegmentOutsideKernel(u64),
    #[error("Kernel segments at {first:#x} and {second:#x} overlap")]
    OverlappingSegments { first: u64, second: u64 },
    #[error("{what} is {len} bytes, at most {max} fit")]
    StringTooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },
    #[error("Handoff record needs {size} bytes, at most {max} are reserved")]
    RecordTooLarge { size: usize, max: usize },
    #[error("Handoff record {start:#x}..{end:#x} is not below the mapped top {top:#x}")]
    RecordOutsideMap { start: u64, end: u64, top: u64 },
    #[error("Address arithmetic overflowed")]
    Overflow,
}
