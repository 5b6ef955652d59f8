use crate::{LayoutConfig, LayoutError, PermissionClass, Segment, SegmentTable};
use alloc::string::ToString;
use alloc::vec::Vec;
use ion_elf::{ET_EXEC, Elf, PT_LOAD, PT_NULL};
use ion_proto::header::HEADER_SIZE;
use log::debug;

/// Check a linked kernel against the [default layout](LayoutConfig::ion).
///
/// # Errors
/// See [`LayoutConfig::verify_elf`].
pub fn verify_elf(bytes: &[u8]) -> Result<SegmentTable, LayoutError> {
    LayoutConfig::ion().verify_elf(bytes)
}

impl LayoutConfig {
    /// Rebuild the segment table from a linked kernel's program headers and
    /// check it the same way [`plan`](crate::plan) output is checked. The
    /// kernel must be a static `ET_EXEC` image with no allocated relocation
    /// or dynamic sections. In addition the boot header section must exist, be exactly
    /// [`HEADER_SIZE`] bytes and sit in `rodata`; every allocated section
    /// must sit in the segment of its class; and the ELF entry must lie in
    /// `text` and equal the entry symbol when a symbol table is present.
    ///
    /// # Errors
    /// Returns the first violated rule.
    pub fn verify_elf(&self, bytes: &[u8]) -> Result<SegmentTable, LayoutError> {
        self.validate()?;
        let elf = Elf::parse(bytes)?;
        if elf.header().elf_type != ET_EXEC {
            return Err(LayoutError::NotExecutable(elf.header().elf_type));
        }
        if let Some(section) = elf.dynamic_section() {
            return Err(LayoutError::DynamicRelocations(section.name.to_string()));
        }

        let mut segments = Vec::with_capacity(4);
        for ph in elf.program_headers() {
            let class = match ph.p_type {
                PT_NULL if ph.flags.into_bits() == 0 => PermissionClass::Null,
                PT_NULL => return Err(LayoutError::NullSegment),
                PT_LOAD => PermissionClass::of_pflags(ph.flags)
                    .filter(|c| *c != PermissionClass::Null)
                    .ok_or(LayoutError::UnclassifiedSegment {
                        vaddr: ph.vaddr,
                        flags: ph.flags.into_bits(),
                    })?,
                _ => continue,
            };
            segments.push(Segment {
                class,
                start: ph.vaddr,
                end: ph.vaddr.checked_add(ph.memsz).ok_or(LayoutError::Overflow)?,
                sections: Vec::new(),
            });
        }

        for section in elf.sections() {
            if section.size == 0 {
                continue;
            }
            let Some(class) = PermissionClass::of_section(section.flags) else {
                return Err(LayoutError::Unclassified(section.name.to_string()));
            };
            if class == PermissionClass::Null {
                continue;
            }
            let home = segments
                .iter_mut()
                .find(|s| s.class != PermissionClass::Null && s.contains(section.addr));
            match home {
                Some(segment) if segment.class == class => {
                    segment.sections.push(section.name.to_string());
                }
                _ => {
                    return Err(LayoutError::SectionPlacement {
                        name: section.name.to_string(),
                        expected: class,
                    });
                }
            }
        }

        let table = SegmentTable::new(segments);
        table.validate(self)?;

        let header = elf
            .section(self.header_section)
            .ok_or(LayoutError::MissingSection(self.header_section))?;
        if header.size != HEADER_SIZE as u64 {
            return Err(LayoutError::HeaderSize {
                size: header.size,
                expected: HEADER_SIZE,
            });
        }
        if table.class_of(header.addr) != Some(PermissionClass::ReadOnly) {
            return Err(LayoutError::SectionPlacement {
                name: header.name.to_string(),
                expected: PermissionClass::ReadOnly,
            });
        }

        let entry = elf.entry();
        if table.class_of(entry) != Some(PermissionClass::ExecuteRead) {
            return Err(LayoutError::EntryOutsideText(entry));
        }
        if elf.has_symbols() {
            let symbol = elf
                .symbol(self.entry_symbol)?
                .ok_or(LayoutError::MissingEntrySymbol(self.entry_symbol))?;
            if symbol.value != entry {
                return Err(LayoutError::EntryMismatch {
                    entry,
                    symbol: self.entry_symbol,
                    value: symbol.value,
                });
            }
        } else {
            debug!("No symbol table; not checking {}", self.entry_symbol);
        }

        for segment in table.segments() {
            debug!(
                "{:<6} {:#x}..{:#x} {:?}",
                segment.name(),
                segment.start,
                segment.end,
                segment.sections
            );
        }
        Ok(table)
    }
}
