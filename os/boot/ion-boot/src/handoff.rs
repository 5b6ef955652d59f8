//! Encoding the boot handoff record.
//!
//! The record is a [`BootInfo`](ion_proto::info::BootInfo) prefix followed
//! by struct tags and the strings they point to, all in one buffer the
//! bootloader copies to a physical address of its choosing:
//!
//! ```text
//! phys_base ┌──────────────────────────┐
//!           │ brand, version, tags ────┼─┐
//!           ├──────────────────────────┤ │
//!           │ memory map tag       ◀───┼─┘
//!           │ framebuffer tag          │
//!           │ modules tag              │
//!           │ command line tag ────────┼─┐
//!           │ HHDM tag                 │ │
//!           │ "command line\0"     ◀───┼─┘
//!           └──────────────────────────┘
//! ```
//!
//! Every pointer in the record goes through [`Addressing::translate`].

use crate::NegotiationError;
use crate::negotiate::Negotiated;
use alloc::string::String;
use alloc::vec::Vec;
use ion_proto::info::{
    BOOT_INFO_SIZE, CMDLINE_ID, FRAMEBUFFER_ID, FramebufferInfo, HHDM_ID, MAX_RECORD_SIZE,
    MEMMAP_ID, MODULE_NAME_LEN, MODULES_ID, MemoryMapEntry, STRING_LEN,
};
use ion_proto::memory::HHDM_BASE;
use log::debug;

/// Brand string placed in every record.
pub const BRAND: &str = "Ion";

/// How pointers in the record are expressed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Addressing {
    /// Low physical addresses, reachable through the identity map.
    Physical,
    /// `HHDM_BASE + phys`.
    HigherHalf,
}

impl Addressing {
    #[must_use]
    pub const fn of(negotiated: &Negotiated) -> Self {
        if negotiated.higher_half() {
            Self::HigherHalf
        } else {
            Self::Physical
        }
    }

    /// Express physical address `phys`. Null stays null.
    ///
    /// # Errors
    /// [`NegotiationError::Overflow`] if `HHDM_BASE + phys` does not fit.
    pub const fn translate(self, phys: u64) -> Result<u64, NegotiationError> {
        match self {
            _ if phys == 0 => Ok(0),
            Self::Physical => Ok(phys),
            Self::HigherHalf => match HHDM_BASE.checked_add(phys) {
                Some(virt) => Ok(virt),
                None => Err(NegotiationError::Overflow),
            },
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct ModuleSpec {
    begin: u64,
    end: u64,
    name: String,
}

/// Collects what the bootloader found and encodes it as a handoff record.
///
/// All addresses given to the builder are physical.
#[derive(Debug, Clone)]
pub struct HandoffBuilder {
    brand: String,
    version: String,
    memory_map: Vec<MemoryMapEntry>,
    framebuffer: Option<FramebufferInfo>,
    modules: Vec<ModuleSpec>,
    cmdline: Option<String>,
}

impl Default for HandoffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            brand: String::from(BRAND),
            version: String::from(env!("CARGO_PKG_VERSION")),
            memory_map: Vec::new(),
            framebuffer: None,
            modules: Vec::new(),
            cmdline: None,
        }
    }

    #[must_use]
    pub fn version(mut self, version: &str) -> Self {
        self.version = String::from(version);
        self
    }

    #[must_use]
    pub fn memory(mut self, entry: MemoryMapEntry) -> Self {
        self.memory_map.push(entry);
        self
    }

    #[must_use]
    pub fn memory_map(mut self, entries: impl IntoIterator<Item = MemoryMapEntry>) -> Self {
        self.memory_map.extend(entries);
        self
    }

    /// The granted framebuffer; `info.addr` is physical.
    #[must_use]
    pub const fn framebuffer(mut self, info: FramebufferInfo) -> Self {
        self.framebuffer = Some(info);
        self
    }

    /// A module loaded at physical `begin..end`.
    #[must_use]
    pub fn module(mut self, begin: u64, end: u64, name: &str) -> Self {
        self.modules.push(ModuleSpec {
            begin,
            end,
            name: String::from(name),
        });
        self
    }

    #[must_use]
    pub fn cmdline(mut self, cmdline: &str) -> Self {
        self.cmdline = Some(String::from(cmdline));
        self
    }

    /// Serialise the record for placement at physical `phys_base`.
    ///
    /// # Errors
    /// Fails if a string does not fit its field or the record exceeds
    /// [`MAX_RECORD_SIZE`].
    pub fn encode(&self, phys_base: u64, addressing: Addressing) -> Result<Vec<u8>, NegotiationError> {
        let mut out = Vec::with_capacity(512);
        put_fixed(&mut out, "brand", &self.brand, STRING_LEN)?;
        put_fixed(&mut out, "version", &self.version, STRING_LEN)?;
        put_u64(&mut out, 0);
        debug_assert_eq!(out.len(), BOOT_INFO_SIZE);

        let mut link_at = BOOT_INFO_SIZE - 8;
        let mut cmdline_slot = None;

        let mut begin_tag = |out: &mut Vec<u8>, id: u64| -> Result<(), NegotiationError> {
            pad8(out);
            let here = phys_base
                .checked_add(out.len() as u64)
                .ok_or(NegotiationError::Overflow)?;
            out[link_at..link_at + 8].copy_from_slice(&addressing.translate(here)?.to_le_bytes());
            link_at = out.len() + 8;
            put_u64(out, id);
            put_u64(out, 0);
            Ok(())
        };

        begin_tag(&mut out, MEMMAP_ID)?;
        put_u64(&mut out, self.memory_map.len() as u64);
        for entry in &self.memory_map {
            put_u64(&mut out, entry.base);
            put_u64(&mut out, entry.length);
            out.extend_from_slice(&entry.kind.to_raw().to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
        }

        if let Some(fb) = &self.framebuffer {
            begin_tag(&mut out, FRAMEBUFFER_ID)?;
            put_u64(&mut out, addressing.translate(fb.addr)?);
            for v in [fb.width, fb.height, fb.pitch, fb.bpp] {
                out.extend_from_slice(&v.to_le_bytes());
            }
            out.extend_from_slice(&[
                fb.memory_model,
                fb.red_mask_size,
                fb.red_mask_shift,
                fb.green_mask_size,
                fb.green_mask_shift,
                fb.blue_mask_size,
                fb.blue_mask_shift,
                0,
            ]);
        }

        if !self.modules.is_empty() {
            begin_tag(&mut out, MODULES_ID)?;
            put_u64(&mut out, self.modules.len() as u64);
            for module in &self.modules {
                put_u64(&mut out, addressing.translate(module.begin)?);
                put_u64(&mut out, addressing.translate(module.end)?);
                put_fixed(&mut out, "module name", &module.name, MODULE_NAME_LEN)?;
            }
        }

        if self.cmdline.is_some() {
            begin_tag(&mut out, CMDLINE_ID)?;
            cmdline_slot = Some(out.len());
            put_u64(&mut out, 0);
        }

        begin_tag(&mut out, HHDM_ID)?;
        put_u64(&mut out, HHDM_BASE);

        if let (Some(slot), Some(cmdline)) = (cmdline_slot, &self.cmdline) {
            pad8(&mut out);
            let here = phys_base
                .checked_add(out.len() as u64)
                .ok_or(NegotiationError::Overflow)?;
            out[slot..slot + 8].copy_from_slice(&addressing.translate(here)?.to_le_bytes());
            out.extend_from_slice(cmdline.as_bytes());
            out.push(0);
        }

        if out.len() > MAX_RECORD_SIZE {
            return Err(NegotiationError::RecordTooLarge {
                size: out.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        debug!(
            "Handoff record: {} bytes at {:#x} ({addressing:?})",
            out.len(),
            phys_base
        );
        Ok(out)
    }
}

/// Register and stack state at the jump into the kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EntryContext {
    pub entry_point: u64,
    pub stack_top: u64,
    /// Passed in `rdi` (System V ABI, first argument).
    pub boot_info: u64,
    pub interrupts_enabled: bool,
}

/// Entry state for a negotiated kernel whose record was placed at
/// physical `record_phys`.
///
/// # Errors
/// [`NegotiationError::Overflow`] if the record address cannot be
/// expressed in the kernel's addressing.
pub fn entry_context(
    negotiated: &Negotiated,
    record_phys: u64,
) -> Result<EntryContext, NegotiationError> {
    Ok(EntryContext {
        entry_point: negotiated.entry,
        stack_top: negotiated.stack,
        boot_info: Addressing::of(negotiated).translate(record_phys)?,
        interrupts_enabled: false,
    })
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad8(out: &mut Vec<u8>) {
    out.resize(out.len().next_multiple_of(8), 0);
}

/// NUL padded field of `len` bytes; at least one NUL must remain.
fn put_fixed(
    out: &mut Vec<u8>,
    what: &'static str,
    s: &str,
    len: usize,
) -> Result<(), NegotiationError> {
    if s.len() >= len {
        return Err(NegotiationError::StringTooLong {
            what,
            len: s.len(),
            max: len - 1,
        });
    }
    out.extend_from_slice(s.as_bytes());
    out.resize(out.len() + (len - s.len()), 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ion_proto::info::{BootInfoView, MemoryKind, StructTag};
    use ion_proto::list::SliceMemory;
    use ion_proto::memory::{is_higher_half, is_lower_half};

    const PHYS: u64 = 0x7f0_0000;

    fn sample() -> HandoffBuilder {
        HandoffBuilder::new()
            .memory(MemoryMapEntry {
                base: 0,
                length: 0x9f000,
                kind: MemoryKind::Usable,
            })
            .memory(MemoryMapEntry {
                base: 0x20_0000,
                length: 0x10_0000,
                kind: MemoryKind::KernelAndModules,
            })
            .framebuffer(FramebufferInfo {
                addr: 0x8000_0000,
                width: 1024,
                height: 768,
                pitch: 4096,
                bpp: 32,
                memory_model: 1,
                red_mask_size: 8,
                red_mask_shift: 16,
                green_mask_size: 8,
                green_mask_shift: 8,
                blue_mask_size: 8,
                blue_mask_shift: 0,
            })
            .module(0x100_0000, 0x100_8000, "initrd")
            .cmdline("console=debug")
    }

    /// Every pointer in the record except the HHDM base, which names a
    /// mapping rather than memory in the record.
    fn pointers(view: &BootInfoView<'_, SliceMemory<'_>>) -> Vec<u64> {
        let mut ptrs = vec![view.head()];
        for tag in view.tags() {
            match tag.unwrap() {
                StructTag::Framebuffer(fb) => ptrs.push(fb.addr),
                StructTag::Modules(m) => {
                    for module in m.iter() {
                        ptrs.extend([module.begin, module.end]);
                    }
                }
                StructTag::Cmdline { addr } => ptrs.push(addr),
                _ => {}
            }
        }
        ptrs
    }

    #[test]
    fn record_reads_back_through_the_kernel_view() {
        let bytes = sample().encode(PHYS, Addressing::Physical).unwrap();
        let mem = SliceMemory::new(PHYS, &bytes);
        let view = BootInfoView::new(&mem, PHYS).unwrap();
        assert_eq!(view.brand(), Some("Ion"));
        assert_eq!(view.version(), Some(env!("CARGO_PKG_VERSION")));

        let tags: Vec<_> = view.tags().map(Result::unwrap).collect();
        assert_eq!(tags.len(), 5);
        let StructTag::MemoryMap(map) = tags[0] else {
            panic!("expected the memory map first");
        };
        let entries: Vec<_> = map.iter().collect();
        assert_eq!(entries[1].kind, MemoryKind::KernelAndModules);

        let StructTag::Modules(modules) = tags[2] else {
            panic!("expected modules");
        };
        assert_eq!(modules.iter().next().unwrap().name, "initrd");

        let StructTag::Cmdline { addr } = tags[3] else {
            panic!("expected the command line");
        };
        assert_eq!(view.string_at(addr), Some("console=debug"));
        assert!(matches!(tags[4], StructTag::Hhdm { addr: HHDM_BASE }));
    }

    #[test]
    fn higher_half_flag_moves_every_pointer_up() {
        let bytes = sample().encode(PHYS, Addressing::HigherHalf).unwrap();
        let mem = SliceMemory::new(HHDM_BASE + PHYS, &bytes);
        let view = BootInfoView::new(&mem, HHDM_BASE + PHYS).unwrap();
        let ptrs = pointers(&view);
        assert_eq!(ptrs.len(), 5);
        assert!(ptrs.iter().all(|&p| is_higher_half(p)), "{ptrs:#x?}");

        let cmdline = view.tags().find_map(|t| match t {
            Ok(StructTag::Cmdline { addr }) => Some(addr),
            _ => None,
        });
        assert_eq!(view.string_at(cmdline.unwrap()), Some("console=debug"));
    }

    #[test]
    fn physical_addressing_keeps_pointers_low() {
        let bytes = sample().encode(PHYS, Addressing::Physical).unwrap();
        let mem = SliceMemory::new(PHYS, &bytes);
        let view = BootInfoView::new(&mem, PHYS).unwrap();
        assert!(pointers(&view).iter().all(|&p| is_lower_half(p)));
    }

    #[test]
    fn minimal_record_has_memory_map_and_hhdm() {
        let bytes = HandoffBuilder::new().encode(PHYS, Addressing::Physical).unwrap();
        let mem = SliceMemory::new(PHYS, &bytes);
        let view = BootInfoView::new(&mem, PHYS).unwrap();
        let tags: Vec<_> = view.tags().map(Result::unwrap).collect();
        assert_eq!(tags.len(), 2);
        assert!(matches!(tags[0], StructTag::MemoryMap(m) if m.is_empty()));
    }

    #[test]
    fn oversized_strings_are_rejected() {
        let long = "x".repeat(MODULE_NAME_LEN);
        let err = HandoffBuilder::new()
            .module(0x1000, 0x2000, &long)
            .encode(PHYS, Addressing::Physical)
            .unwrap_err();
        assert_eq!(
            err,
            NegotiationError::StringTooLong {
                what: "module name",
                len: MODULE_NAME_LEN,
                max: MODULE_NAME_LEN - 1
            }
        );
    }

    #[test]
    fn oversized_record_is_rejected() {
        let entry = MemoryMapEntry {
            base: 0,
            length: 0x1000,
            kind: MemoryKind::Reserved,
        };
        let err = HandoffBuilder::new()
            .memory_map(core::iter::repeat_n(entry, 4096))
            .encode(PHYS, Addressing::Physical)
            .unwrap_err();
        assert!(matches!(err, NegotiationError::RecordTooLarge { .. }));
    }

    #[test]
    fn null_pointers_are_not_translated() {
        assert_eq!(Addressing::HigherHalf.translate(0), Ok(0));
        assert_eq!(Addressing::HigherHalf.translate(0x1000), Ok(HHDM_BASE + 0x1000));
        assert_eq!(Addressing::Physical.translate(0x1000), Ok(0x1000));
    }

    #[test]
    fn pointers_past_the_direct_map_overflow() {
        assert_eq!(
            Addressing::HigherHalf.translate(u64::MAX - 0x10),
            Err(NegotiationError::Overflow)
        );
        assert_eq!(Addressing::Physical.translate(u64::MAX), Ok(u64::MAX));

        let err = HandoffBuilder::new()
            .module(0x1000, u64::MAX, "tail")
            .encode(PHYS, Addressing::HigherHalf)
            .unwrap_err();
        assert_eq!(err, NegotiationError::Overflow);
    }
}
