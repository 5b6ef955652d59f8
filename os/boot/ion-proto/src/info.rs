//! # Boot Handoff Record
//!
//! The record the bootloader passes to [`ion_main`](crate::entry::ENTRY_SYMBOL).
//! A fixed [`BootInfo`] prefix carries the bootloader brand and version and
//! the head of a struct tag list. Struct tags use the same framing as header
//! tags (see [`list`](crate::list)) and are identified by the `*_ID`
//! constants below.
//!
//! Every address in the record, including the tag links, is expressed the
//! way the kernel asked for in the boot header: `HHDM_BASE + phys` when the
//! higher-half flag was set, the plain physical address otherwise.
//!
//! ```text
//! offset  size  field
//! 0       64    brand   (NUL padded)
//! 64      64    version (NUL padded)
//! 128     8     head of the struct tag list
//! ```

use crate::list::{ListError, RawTag, SliceMemory, TagList, TagMemory, read_u16_le, read_u64_le};

/// Struct tag identifier: memory map.
pub const MEMMAP_ID: u64 = 0x2187_f79e_8612_de07;

/// Struct tag identifier: granted framebuffer.
pub const FRAMEBUFFER_ID: u64 = 0x5064_61d2_9504_08fa;

/// Struct tag identifier: loaded modules.
pub const MODULES_ID: u64 = 0x4b6f_e466_aade_04ce;

/// Struct tag identifier: kernel command line.
pub const CMDLINE_ID: u64 = 0xe5e7_6a1b_4597_a781;

/// Struct tag identifier: higher-half direct map base.
pub const HHDM_ID: u64 = 0xb0ed_257d_b18c_b58f;

/// Length of the brand and version strings.
pub const STRING_LEN: usize = 64;

/// Encoded size of [`BootInfo`].
pub const BOOT_INFO_SIZE: usize = 2 * STRING_LEN + 8;

/// Upper bound for an encoded record. The bootloader reserves this many
/// bytes at the record address, so a kernel may read that far.
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

/// Encoded size of one memory map entry: `{u64 base, u64 length, u32 type, u32 unused}`.
pub const MEMMAP_ENTRY_SIZE: usize = 24;

/// Encoded size of the framebuffer struct tag payload.
pub const FRAMEBUFFER_PAYLOAD_SIZE: usize = 24;

/// Length of a module's NUL padded name.
pub const MODULE_NAME_LEN: usize = 128;

/// Encoded size of one module entry: `{u64 begin, u64 end, [u8; 128] name}`.
pub const MODULE_ENTRY_SIZE: usize = 16 + MODULE_NAME_LEN;

/// The fixed record prefix.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub brand: [u8; STRING_LEN],
    pub version: [u8; STRING_LEN],
    pub tags: u64,
}

impl BootInfo {
    /// The brand up to the first NUL, if it is UTF-8.
    #[must_use]
    pub fn brand(&self) -> Option<&str> {
        nul_terminated(&self.brand)
    }

    /// The version up to the first NUL, if it is UTF-8.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        nul_terminated(&self.version)
    }
}

/// Memory map entry types.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    /// Bootloader data the kernel may reclaim once it no longer needs the record.
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
    Other(u32),
}

impl MemoryKind {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            0x1000 => Self::BootloaderReclaimable,
            0x1001 => Self::KernelAndModules,
            0x1002 => Self::Framebuffer,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Usable => 1,
            Self::Reserved => 2,
            Self::AcpiReclaimable => 3,
            Self::AcpiNvs => 4,
            Self::BadMemory => 5,
            Self::BootloaderReclaimable => 0x1000,
            Self::KernelAndModules => 0x1001,
            Self::Framebuffer => 0x1002,
            Self::Other(raw) => raw,
        }
    }
}

/// One physical memory range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

/// Granted framebuffer. `addr` follows the record's addressing.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub width: u16,
    pub height: u16,
    /// Bytes per scanline.
    pub pitch: u16,
    pub bpp: u16,
    /// 1 = RGB.
    pub memory_model: u8,
    pub red_mask_size: u8,
    pub red_mask_shift: u8,
    pub green_mask_size: u8,
    pub green_mask_shift: u8,
    pub blue_mask_size: u8,
    pub blue_mask_shift: u8,
}

/// Entries of a memory map tag.
#[derive(Debug, Copy, Clone)]
pub struct MemoryMap<'m> {
    bytes: &'m [u8],
}

impl<'m> MemoryMap<'m> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len() / MEMMAP_ENTRY_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MemoryMapEntry> + 'm {
        self.bytes
            .chunks_exact(MEMMAP_ENTRY_SIZE)
            .map(|e| MemoryMapEntry {
                base: read_u64_le(e, 0),
                length: read_u64_le(e, 8),
                kind: MemoryKind::from_raw(read_u32_le(e, 16)),
            })
    }
}

/// One loaded module.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Module<'m> {
    pub begin: u64,
    pub end: u64,
    pub name: &'m str,
}

/// Entries of a modules tag.
#[derive(Debug, Copy, Clone)]
pub struct Modules<'m> {
    bytes: &'m [u8],
}

impl<'m> Modules<'m> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len() / MODULE_ENTRY_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Module<'m>> + 'm {
        self.bytes.chunks_exact(MODULE_ENTRY_SIZE).map(|e| Module {
            begin: read_u64_le(e, 0),
            end: read_u64_le(e, 8),
            name: nul_terminated(&e[16..]).unwrap_or_default(),
        })
    }
}

/// Struct tags, dispatched by identifier.
#[derive(Debug, Copy, Clone)]
pub enum StructTag<'m> {
    MemoryMap(MemoryMap<'m>),
    Framebuffer(FramebufferInfo),
    Modules(Modules<'m>),
    /// Address of a NUL terminated command line.
    Cmdline { addr: u64 },
    Hhdm { addr: u64 },
    Unknown { id: u64 },
}

impl<'m> StructTag<'m> {
    /// Decode a raw struct tag.
    ///
    /// # Errors
    /// Fails if a known tag's payload is truncated.
    pub fn decode(raw: &RawTag<'m>) -> Result<Self, ListError> {
        Ok(match raw.id {
            MEMMAP_ID => {
                let len = counted(raw, MEMMAP_ENTRY_SIZE)?;
                Self::MemoryMap(MemoryMap {
                    bytes: &raw.take(len)?[8..],
                })
            }
            FRAMEBUFFER_ID => {
                let p = raw.take(FRAMEBUFFER_PAYLOAD_SIZE)?;
                Self::Framebuffer(FramebufferInfo {
                    addr: read_u64_le(p, 0),
                    width: read_u16_le(p, 8),
                    height: read_u16_le(p, 10),
                    pitch: read_u16_le(p, 12),
                    bpp: read_u16_le(p, 14),
                    memory_model: p[16],
                    red_mask_size: p[17],
                    red_mask_shift: p[18],
                    green_mask_size: p[19],
                    green_mask_shift: p[20],
                    blue_mask_size: p[21],
                    blue_mask_shift: p[22],
                })
            }
            MODULES_ID => {
                let len = counted(raw, MODULE_ENTRY_SIZE)?;
                Self::Modules(Modules {
                    bytes: &raw.take(len)?[8..],
                })
            }
            CMDLINE_ID => Self::Cmdline {
                addr: read_u64_le(raw.take(8)?, 0),
            },
            HHDM_ID => Self::Hhdm {
                addr: read_u64_le(raw.take(8)?, 0),
            },
            id => Self::Unknown { id },
        })
    }
}

/// Reads the leading entry count and returns the payload length it implies.
fn counted(raw: &RawTag<'_>, entry_size: usize) -> Result<usize, ListError> {
    let count = read_u64_le(raw.take(8)?, 0);
    usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(entry_size))
        .and_then(|n| n.checked_add(8))
        .ok_or(ListError::Truncated {
            addr: raw.addr,
            needed: usize::MAX,
            available: raw.payload.len(),
        })
}

/// Kernel-side reader for an encoded record.
pub struct BootInfoView<'m, M: TagMemory + ?Sized> {
    mem: &'m M,
    addr: u64,
    prefix: &'m [u8],
}

impl<'m, M: TagMemory + ?Sized> BootInfoView<'m, M> {
    /// Open the record at `addr`.
    ///
    /// # Errors
    /// Fails if the fixed prefix is not readable in full.
    pub fn new(mem: &'m M, addr: u64) -> Result<Self, ListError> {
        let bytes = mem.bytes_from(addr).ok_or(ListError::Dangling { addr })?;
        let prefix = bytes.get(..BOOT_INFO_SIZE).ok_or(ListError::Truncated {
            addr,
            needed: BOOT_INFO_SIZE,
            available: bytes.len(),
        })?;
        Ok(Self { mem, addr, prefix })
    }

    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    #[must_use]
    pub fn brand(&self) -> Option<&'m str> {
        nul_terminated(&self.prefix[..STRING_LEN])
    }

    #[must_use]
    pub fn version(&self) -> Option<&'m str> {
        nul_terminated(&self.prefix[STRING_LEN..2 * STRING_LEN])
    }

    /// Address of the first struct tag, `0` if there is none.
    #[must_use]
    pub fn head(&self) -> u64 {
        read_u64_le(self.prefix, 2 * STRING_LEN)
    }

    /// All known struct tags. Unknown identifiers are skipped; a malformed
    /// list yields one error and ends.
    pub fn tags(&self) -> impl Iterator<Item = Result<StructTag<'m>, ListError>> + 'm {
        TagList::new(self.mem, self.head())
            .map(|raw| raw.and_then(|raw| StructTag::decode(&raw)))
            .filter(|tag| !matches!(tag, Ok(StructTag::Unknown { .. })))
    }

    /// Read the NUL terminated string at `addr`, if it lies in this memory.
    #[must_use]
    pub fn string_at(&self, addr: u64) -> Option<&'m str> {
        nul_terminated(self.mem.bytes_from(addr)?)
    }
}

/// Memory covering a record pointer as received in `ion_main`.
///
/// # Safety
/// `info` must point to at least [`MAX_RECORD_SIZE`] readable bytes that
/// stay valid and unmodified for `'m`. The bootloader reserves that much for
/// the record it hands over.
#[allow(unsafe_code)]
#[must_use]
pub unsafe fn record_memory<'m>(info: *const BootInfo) -> SliceMemory<'m> {
    // SAFETY: guaranteed by the caller.
    let bytes = unsafe { core::slice::from_raw_parts(info.cast::<u8>(), MAX_RECORD_SIZE) };
    SliceMemory::new(info as u64, bytes)
}

fn nul_terminated(bytes: &[u8]) -> Option<&str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).ok()
}

#[inline]
fn read_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

const _: () = {
    assert!(core::mem::size_of::<BootInfo>() == BOOT_INFO_SIZE);
    assert!(BOOT_INFO_SIZE.is_multiple_of(8));
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::tests::build_list;

    const BASE: u64 = 0x8000;

    fn record(tags: &[(u64, Option<usize>, &[u8])]) -> std::vec::Vec<u8> {
        let mut out = std::vec![0u8; BOOT_INFO_SIZE];
        out[..3].copy_from_slice(b"Ion");
        out[STRING_LEN..STRING_LEN + 5].copy_from_slice(b"0.1.0");
        let list_base = BASE + BOOT_INFO_SIZE as u64;
        if !tags.is_empty() {
            out[128..136].copy_from_slice(&list_base.to_le_bytes());
        }
        out.extend(build_list(list_base, tags));
        out
    }

    #[test]
    fn reads_brand_and_version() {
        let bytes = record(&[]);
        let mem = SliceMemory::new(BASE, &bytes);
        let view = BootInfoView::new(&mem, BASE).unwrap();
        assert_eq!(view.brand(), Some("Ion"));
        assert_eq!(view.version(), Some("0.1.0"));
        assert_eq!(view.head(), 0);
        assert_eq!(view.tags().count(), 0);
    }

    #[test]
    fn decodes_memory_map_and_skips_unknown() {
        let mut memmap = std::vec::Vec::new();
        memmap.extend_from_slice(&2u64.to_le_bytes());
        for (base, len, kind) in [(0u64, 0x9f000u64, 1u32), (0x20_0000, 0x1000, 0x1001)] {
            memmap.extend_from_slice(&base.to_le_bytes());
            memmap.extend_from_slice(&len.to_le_bytes());
            memmap.extend_from_slice(&kind.to_le_bytes());
            memmap.extend_from_slice(&0u32.to_le_bytes());
        }
        let hhdm = 0xffff_8000_0000_0000u64.to_le_bytes();

        let bytes = record(&[
            (0x0bad_cafe, Some(1), &[]),
            (MEMMAP_ID, Some(2), &memmap),
            (HHDM_ID, None, &hhdm),
        ]);
        let mem = SliceMemory::new(BASE, &bytes);
        let view = BootInfoView::new(&mem, BASE).unwrap();
        let tags: std::vec::Vec<_> = view.tags().map(Result::unwrap).collect();
        assert_eq!(tags.len(), 2);

        let StructTag::MemoryMap(map) = tags[0] else {
            panic!("expected memory map first");
        };
        let entries: std::vec::Vec<_> = map.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, MemoryKind::KernelAndModules);
        assert_eq!(entries[0].length, 0x9f000);

        assert!(matches!(
            tags[1],
            StructTag::Hhdm {
                addr: 0xffff_8000_0000_0000
            }
        ));
    }

    #[test]
    fn oversized_entry_count_is_truncation() {
        let payload = u64::MAX.to_le_bytes();
        let bytes = record(&[(MODULES_ID, None, &payload)]);
        let mem = SliceMemory::new(BASE, &bytes);
        let view = BootInfoView::new(&mem, BASE).unwrap();
        let err = view.tags().next().unwrap().unwrap_err();
        assert!(matches!(err, ListError::Truncated { .. }));
    }

    #[test]
    fn short_prefix_is_rejected() {
        let bytes = [0u8; BOOT_INFO_SIZE - 8];
        let mem = SliceMemory::new(BASE, &bytes);
        assert!(BootInfoView::new(&mem, BASE).is_err());
    }

    #[test]
    fn memory_kind_raw_values_are_stable() {
        for raw in [1, 2, 3, 4, 5, 0x1000, 0x1001, 0x1002, 77] {
            assert_eq!(MemoryKind::from_raw(raw).to_raw(), raw);
        }
    }
}
