//! # Boot Header
//!
//! The kernel-side half of the capability negotiation. A kernel places one
//! [`BootHeader`] in the `.ionhdr` section; the bootloader finds it by
//! section name, reads the requested stack and flags, and walks the
//! [header tag](TagHeader) list starting at [`BootHeader::tags`].
//!
//! The `#[repr(C)]` declarations here are what a kernel links into its image.
//! The bootloader never dereferences them; it decodes the same bytes with
//! [`HeaderTag::decode`] through a [`TagMemory`](crate::list::TagMemory).

use crate::list::{ListError, RawTag, read_u16_le, read_u64_le};
use core::ptr;

/// Name of the section holding the [`BootHeader`].
pub const HEADER_SECTION: &str = ".ionhdr";

/// Encoded size of the [`BootHeader`].
pub const HEADER_SIZE: usize = 32;

/// Header tag identifier: framebuffer request.
pub const FRAMEBUFFER_ID: u64 = 0x3ecc_1bc4_3d0f_7971;

/// Header tag identifier: accept any video mode.
pub const ANY_VIDEO_ID: u64 = 0xc75c_9fa9_2a44_c4db;

/// Header tag identifier: keep page zero unmapped.
pub const UNMAP_NULL_ID: u64 = 0x9291_9432_b16f_e7e7;

/// Request flags (`BootHeader::flags`).
///
/// Layout (LSB→MSB):
/// - bit 0: hand over every pointer as a higher-half address
/// - bit 1: enforce the ELF program header permissions when mapping the kernel
/// - bits 2..63: reserved, must be zero
#[bitfield_struct::bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct HeaderFlags {
    #[bits(1)]
    pub higher_half: bool,
    #[bits(1)]
    pub protected_memory: bool,
    #[bits(62)]
    pub reserved: u64,
}

impl HeaderFlags {
    /// Both opt-in guarantees.
    pub const ALL: Self = Self::new().with_higher_half(true).with_protected_memory(true);
}

/// Framing shared by all header tags.
#[repr(C)]
#[derive(Debug)]
pub struct TagHeader {
    pub identifier: u64,
    pub next: *const TagHeader,
}

impl TagHeader {
    #[must_use]
    pub const fn new(identifier: u64) -> Self {
        Self {
            identifier,
            next: ptr::null(),
        }
    }
}

/// The header the kernel links into `.ionhdr`.
#[repr(C)]
#[derive(Debug)]
pub struct BootHeader {
    /// Entry point override; null means "use the ELF entry".
    pub entry_point: *const (),
    /// Initial stack pointer (top of a kernel-owned block).
    pub stack: *const u8,
    /// Request flags, see [`HeaderFlags`].
    pub flags: u64,
    /// Head of the header tag list; null for no tags.
    pub tags: *const TagHeader,
}

// SAFETY: the header is immutable and only read by the bootloader.
#[allow(unsafe_code)]
unsafe impl Sync for BootHeader {}

impl Default for BootHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl BootHeader {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entry_point: ptr::null(),
            stack: ptr::null(),
            flags: 0,
            tags: ptr::null(),
        }
    }

    #[must_use]
    pub const fn stack(mut self, top: *const u8) -> Self {
        self.stack = top;
        self
    }

    #[must_use]
    pub const fn flags(mut self, flags: HeaderFlags) -> Self {
        self.flags = flags.into_bits();
        self
    }

    #[must_use]
    pub const fn tags(mut self, head: *const TagHeader) -> Self {
        self.tags = head;
        self
    }

    #[must_use]
    pub const fn entry_point(mut self, entry: *const ()) -> Self {
        self.entry_point = entry;
        self
    }
}

/// Framebuffer request. Zero fields mean "no preference".
#[repr(C)]
#[derive(Debug)]
pub struct FramebufferTag {
    pub tag: TagHeader,
    pub width: u64,
    pub height: u64,
    pub bpp: u16,
}

// SAFETY: see `BootHeader`.
#[allow(unsafe_code)]
unsafe impl Sync for FramebufferTag {}

impl FramebufferTag {
    #[must_use]
    pub const fn new(width: u64, height: u64, bpp: u16) -> Self {
        Self {
            tag: TagHeader::new(FRAMEBUFFER_ID),
            width,
            height,
            bpp,
        }
    }

    #[must_use]
    pub const fn next(mut self, next: *const TagHeader) -> Self {
        self.tag.next = next;
        self
    }
}

/// Accept any video mode the bootloader can provide.
#[repr(C)]
#[derive(Debug)]
pub struct AnyVideoTag {
    pub tag: TagHeader,
    /// 0: prefer a linear framebuffer, 1: no preference.
    pub preference: u64,
}

// SAFETY: see `BootHeader`.
#[allow(unsafe_code)]
unsafe impl Sync for AnyVideoTag {}

impl AnyVideoTag {
    #[must_use]
    pub const fn new(preference: u64) -> Self {
        Self {
            tag: TagHeader::new(ANY_VIDEO_ID),
            preference,
        }
    }

    #[must_use]
    pub const fn next(mut self, next: *const TagHeader) -> Self {
        self.tag.next = next;
        self
    }
}

/// Keep the first page of the lower half unmapped.
#[repr(C)]
#[derive(Debug)]
pub struct UnmapNullTag {
    pub tag: TagHeader,
}

// SAFETY: see `BootHeader`.
#[allow(unsafe_code)]
unsafe impl Sync for UnmapNullTag {}

impl UnmapNullTag {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tag: TagHeader::new(UNMAP_NULL_ID),
        }
    }

    #[must_use]
    pub const fn next(mut self, next: *const TagHeader) -> Self {
        self.tag.next = next;
        self
    }
}

impl Default for UnmapNullTag {
    fn default() -> Self {
        Self::new()
    }
}

/// The boot header as decoded from a kernel image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DecodedHeader {
    pub entry_point: u64,
    pub stack: u64,
    pub flags: HeaderFlags,
    pub tags: u64,
}

impl DecodedHeader {
    /// Decode the 32 bytes of `.ionhdr`.
    ///
    /// Returns `None` if `bytes` is not exactly [`HEADER_SIZE`] long.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HEADER_SIZE {
            return None;
        }
        Some(Self {
            entry_point: read_u64_le(bytes, 0),
            stack: read_u64_le(bytes, 8),
            flags: HeaderFlags::from_bits(read_u64_le(bytes, 16)),
            tags: read_u64_le(bytes, 24),
        })
    }
}

/// A framebuffer request as understood by the bootloader.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FramebufferRequest {
    pub width: u64,
    pub height: u64,
    pub bpp: u16,
}

impl FramebufferRequest {
    /// Payload size on the wire: `{u64 width, u64 height, u16 bpp}`.
    pub const PAYLOAD_SIZE: usize = 18;

    /// `true` if every field is zero, i.e. the bootloader picks.
    #[must_use]
    pub const fn is_default(&self) -> bool {
        self.width == 0 && self.height == 0 && self.bpp == 0
    }
}

/// Header tags, dispatched by identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeaderTag {
    Framebuffer(FramebufferRequest),
    AnyVideo { preference: u64 },
    UnmapNull,
    /// A tag this bootloader does not know. Consumers skip it.
    Unknown { id: u64 },
}

impl HeaderTag {
    /// Decode a raw tag.
    ///
    /// # Errors
    /// Fails only if a known tag's payload is truncated; unknown identifiers
    /// decode to [`HeaderTag::Unknown`].
    pub fn decode(raw: &RawTag<'_>) -> Result<Self, ListError> {
        Ok(match raw.id {
            FRAMEBUFFER_ID => {
                let p = raw.take(FramebufferRequest::PAYLOAD_SIZE)?;
                Self::Framebuffer(FramebufferRequest {
                    width: read_u64_le(p, 0),
                    height: read_u64_le(p, 8),
                    bpp: read_u16_le(p, 16),
                })
            }
            ANY_VIDEO_ID => {
                let p = raw.take(8)?;
                Self::AnyVideo {
                    preference: read_u64_le(p, 0),
                }
            }
            UNMAP_NULL_ID => Self::UnmapNull,
            id => Self::Unknown { id },
        })
    }
}

const _: () = {
    assert!(core::mem::size_of::<BootHeader>() == HEADER_SIZE);
    assert!(core::mem::size_of::<TagHeader>() == crate::list::TAG_HEADER_SIZE);
    assert!(core::mem::offset_of!(FramebufferTag, bpp) == 32);
};
