use crate::NegotiationError;
use alloc::string::ToString;
use ion_elf::{ET_EXEC, Elf, ProgramHeader};
use ion_proto::header::{DecodedHeader, HEADER_SECTION, HEADER_SIZE};
use ion_proto::list::TagMemory;
use log::debug;

/// A kernel ELF with its boot header located and decoded.
///
/// Header addresses (stack, tag list, entry point) are the kernel's link-time
/// virtual addresses. [`TagMemory`] is implemented over the file so the tag
/// list can be walked before anything is loaded: an address resolves to the
/// file bytes of the `PT_LOAD` segment covering it.
#[derive(Debug)]
pub struct KernelImage<'a> {
    elf: Elf<'a>,
    header: DecodedHeader,
}

impl<'a> KernelImage<'a> {
    /// The header is read straight from the file, so the kernel must be a
    /// static `ET_EXEC` image: relocations are never applied.
    ///
    /// # Errors
    /// Fails if the ELF is malformed or not a static executable, has no
    /// header section, or the section is not exactly [`HEADER_SIZE`] bytes.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, NegotiationError> {
        let elf = Elf::parse(bytes)?;
        if elf.header().elf_type != ET_EXEC {
            return Err(NegotiationError::NotExecutable(elf.header().elf_type));
        }
        if let Some(section) = elf.dynamic_section() {
            return Err(NegotiationError::DynamicRelocations(section.name.to_string()));
        }
        let section = elf
            .section(HEADER_SECTION)
            .ok_or(NegotiationError::MissingHeader(HEADER_SECTION))?;
        let data = elf.section_data(section)?;
        let header = DecodedHeader::decode(data).ok_or(NegotiationError::HeaderSize {
            size: section.size,
            expected: HEADER_SIZE,
        })?;
        debug!(
            "Boot header at {:#x}: entry {:#x}, stack {:#x}, flags {:#x}, tags {:#x}",
            section.addr,
            header.entry_point,
            header.stack,
            header.flags.into_bits(),
            header.tags
        );
        Ok(Self { elf, header })
    }

    #[must_use]
    pub const fn header(&self) -> &DecodedHeader {
        &self.header
    }

    #[must_use]
    pub const fn elf(&self) -> &Elf<'a> {
        &self.elf
    }

    /// Entry point to jump to.
    ///
    /// The header's `entry_point` overrides the ELF entry when non-zero.
    #[must_use]
    pub const fn entry(&self) -> u64 {
        if self.header.entry_point != 0 {
            self.header.entry_point
        } else {
            self.elf.entry()
        }
    }

    /// The loaded segment containing `vaddr`, if any.
    #[must_use]
    pub fn segment_at(&self, vaddr: u64) -> Option<&ProgramHeader> {
        self.elf.load_segments().find(|ph| ph.contains(vaddr))
    }
}

impl TagMemory for KernelImage<'_> {
    fn bytes_from(&self, addr: u64) -> Option<&[u8]> {
        let ph = self
            .elf
            .load_segments()
            .find(|ph| addr >= ph.vaddr && addr - ph.vaddr < ph.filesz)?;
        let data = self.elf.segment_data(ph).ok()?;
        let off = usize::try_from(addr - ph.vaddr).ok()?;
        data.get(off..)
    }
}
