use crate::{LayoutConfig, LayoutError, PermissionClass};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use ion_proto::memory::is_higher_half;
use log::debug;

/// A section as emitted by the compiler, before addresses are assigned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CompiledSection<'a> {
    pub name: &'a str,
    pub size: u64,
    pub align: u64,
    /// `SHF_*` flags.
    pub flags: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub class: PermissionClass,
    /// First byte.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
    /// Names of the sections placed in this segment.
    pub sections: Vec<String>,
}

impl Segment {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.class.segment_name()
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.start
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The null segment followed by the three loaded segments.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    #[must_use]
    pub const fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn get(&self, class: PermissionClass) -> Option<&Segment> {
        self.segments.iter().find(|s| s.class == class)
    }

    /// Class of the loaded segment containing `addr`.
    #[must_use]
    pub fn class_of(&self, addr: u64) -> Option<PermissionClass> {
        self.segments
            .iter()
            .filter(|s| s.class != PermissionClass::Null)
            .find(|s| s.contains(addr))
            .map(|s| s.class)
    }

    /// Check every segment invariant: null first, one segment per loaded
    /// class in `text`, `rodata`, `data` order, page aligned starts in the
    /// higher half, no overlap and a full padding page between neighbours.
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self, config: &LayoutConfig) -> Result<(), LayoutError> {
        let Some((null, loaded)) = self.segments.split_first() else {
            return Err(LayoutError::NullSegment);
        };
        if null.class != PermissionClass::Null {
            return Err(LayoutError::NullSegment);
        }

        for class in PermissionClass::LOADED {
            let count = loaded.iter().filter(|s| s.class == class).count();
            if count != 1 {
                return Err(LayoutError::SegmentCount { class, count });
            }
        }
        if let Some(extra) = loaded.iter().find(|s| s.class == PermissionClass::Null) {
            return Err(LayoutError::OutOfOrder(extra.name()));
        }
        for (segment, class) in loaded.iter().zip(PermissionClass::LOADED) {
            if segment.class != class {
                return Err(LayoutError::OutOfOrder(segment.name()));
            }
        }

        for segment in loaded {
            if !segment.start.is_multiple_of(config.page_size) {
                return Err(LayoutError::Misaligned {
                    name: segment.name(),
                    start: segment.start,
                });
            }
            if !is_higher_half(segment.start) {
                return Err(LayoutError::LowerHalf {
                    name: segment.name(),
                    start: segment.start,
                });
            }
            if segment.end < segment.start {
                return Err(LayoutError::Overflow);
            }
        }

        for pair in self.segments.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.start < prev.end {
                return Err(LayoutError::Overlap {
                    first: prev.name(),
                    second: next.name(),
                });
            }
            if next.start < padded_end(prev.end, config.page_size)? {
                return Err(LayoutError::Padding {
                    first: prev.name(),
                    second: next.name(),
                });
            }
        }

        Ok(())
    }
}

/// Page-rounded `end` plus one padding page.
fn padded_end(end: u64, page_size: u64) -> Result<u64, LayoutError> {
    end.checked_next_multiple_of(page_size)
        .and_then(|e| e.checked_add(page_size))
        .ok_or(LayoutError::Overflow)
}

/// Assign addresses to `sections`.
///
/// Sections keep their relative order within a class; the boot header
/// section always comes first in `rodata`. Sections without `SHF_ALLOC` are
/// not placed.
///
/// # Errors
/// Fails if the configuration is invalid, the boot header section is
/// missing or not read-only, a section is writable and executable, or the
/// resulting table violates a segment invariant.
pub fn plan(config: &LayoutConfig, sections: &[CompiledSection<'_>]) -> Result<SegmentTable, LayoutError> {
    config.validate()?;

    let header = sections
        .iter()
        .find(|s| s.name == config.header_section)
        .ok_or(LayoutError::MissingSection(config.header_section))?;
    if PermissionClass::of_section(header.flags) != Some(PermissionClass::ReadOnly) {
        return Err(LayoutError::SectionPlacement {
            name: header.name.to_string(),
            expected: PermissionClass::ReadOnly,
        });
    }

    let mut buckets: [Vec<&CompiledSection<'_>>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    buckets[1].push(header);
    for section in sections.iter().filter(|s| s.name != config.header_section) {
        match PermissionClass::of_section(section.flags) {
            None => return Err(LayoutError::Unclassified(section.name.to_string())),
            Some(PermissionClass::Null) => {
                debug!("Not placing non-allocated section {}", section.name);
            }
            Some(PermissionClass::ExecuteRead) => buckets[0].push(section),
            Some(PermissionClass::ReadOnly) => buckets[1].push(section),
            Some(PermissionClass::ReadWrite) => buckets[2].push(section),
        }
    }

    let null = Segment {
        class: PermissionClass::Null,
        start: config.kernel_base,
        end: config
            .kernel_base
            .checked_add(config.page_size)
            .ok_or(LayoutError::Overflow)?,
        sections: Vec::new(),
    };
    let mut cursor = null.end;
    let mut segments = Vec::with_capacity(4);
    segments.push(null);

    for (class, bucket) in PermissionClass::LOADED.into_iter().zip(buckets) {
        let start = padded_end(cursor, config.page_size)?;
        let mut addr = start;
        let mut names = Vec::with_capacity(bucket.len());
        for section in bucket {
            let align = section
                .align
                .max(1)
                .checked_next_power_of_two()
                .ok_or(LayoutError::Overflow)?;
            addr = addr
                .checked_next_multiple_of(align)
                .and_then(|a| a.checked_add(section.size))
                .ok_or(LayoutError::Overflow)?;
            names.push(section.name.to_string());
        }
        debug!(
            "Segment {} at {start:#x}..{addr:#x}: {names:?}",
            class.segment_name()
        );
        segments.push(Segment {
            class,
            start,
            end: addr,
            sections: names,
        });
        cursor = addr;
    }

    let table = SegmentTable::new(segments);
    table.validate(config)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ion_elf::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE};

    const TEXT: u64 = SHF_ALLOC | SHF_EXECINSTR;
    const RO: u64 = SHF_ALLOC;
    const RW: u64 = SHF_ALLOC | SHF_WRITE;

    fn section(name: &str, size: u64, flags: u64) -> CompiledSection<'_> {
        CompiledSection {
            name,
            size,
            align: 16,
            flags,
        }
    }

    fn kernel_sections() -> [CompiledSection<'static>; 6] {
        [
            section(".text", 0x1234, TEXT),
            section(".rodata", 0x300, RO),
            section(".ionhdr", 32, RO),
            section(".data", 0x10, RW),
            section(".bss", 10 * 16 * 1024, RW),
            section(".comment", 0x40, 0),
        ]
    }

    #[test]
    fn plans_four_ordered_segments() {
        let config = LayoutConfig::ion();
        let table = plan(&config, &kernel_sections()).unwrap();
        let names: Vec<_> = table.segments().iter().map(Segment::name).collect();
        assert_eq!(names, ["null", "text", "rodata", "data"]);

        let null = &table.segments()[0];
        assert_eq!(null.start, config.kernel_base);
        assert!(null.sections.is_empty());

        let text = table.get(PermissionClass::ExecuteRead).unwrap();
        assert_eq!(text.start, config.kernel_base + 2 * config.page_size);
    }

    #[test]
    fn header_leads_rodata() {
        let table = plan(&LayoutConfig::ion(), &kernel_sections()).unwrap();
        let rodata = table.get(PermissionClass::ReadOnly).unwrap();
        assert_eq!(rodata.sections, [".ionhdr", ".rodata"]);
    }

    #[test]
    fn every_gap_holds_a_padding_page() {
        let config = LayoutConfig::ion();
        let table = plan(&config, &kernel_sections()).unwrap();
        for pair in table.segments().windows(2) {
            let rounded = pair[0].end.next_multiple_of(config.page_size);
            assert!(pair[1].start >= rounded + config.page_size);
            assert!(pair[1].start.is_multiple_of(config.page_size));
        }
    }

    #[test]
    fn skips_unallocated_sections() {
        let table = plan(&LayoutConfig::ion(), &kernel_sections()).unwrap();
        assert!(
            table
                .segments()
                .iter()
                .all(|s| !s.sections.iter().any(|n| n == ".comment"))
        );
    }

    #[test]
    fn missing_header_is_an_error() {
        let sections = [section(".text", 0x10, TEXT)];
        assert_eq!(
            plan(&LayoutConfig::ion(), &sections),
            Err(LayoutError::MissingSection(".ionhdr"))
        );
    }

    #[test]
    fn writable_header_is_an_error() {
        let sections = [section(".ionhdr", 32, RW)];
        assert!(matches!(
            plan(&LayoutConfig::ion(), &sections),
            Err(LayoutError::SectionPlacement { .. })
        ));
    }

    #[test]
    fn writable_code_fits_no_class() {
        let sections = [
            section(".ionhdr", 32, RO),
            section(".wx", 16, SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR),
        ];
        assert_eq!(
            plan(&LayoutConfig::ion(), &sections),
            Err(LayoutError::Unclassified(".wx".into()))
        );
    }

    #[test]
    fn huge_alignment_overflows() {
        let mut sections = kernel_sections();
        sections[0].align = (1 << 63) + 1;
        assert_eq!(plan(&LayoutConfig::ion(), &sections), Err(LayoutError::Overflow));

        // A section that cannot fit after its aligned start.
        sections[0].align = 16;
        sections[0].size = u64::MAX;
        assert_eq!(plan(&LayoutConfig::ion(), &sections), Err(LayoutError::Overflow));
    }

    #[test]
    fn empty_segments_are_still_planned() {
        let sections = [section(".ionhdr", 32, RO)];
        let table = plan(&LayoutConfig::ion(), &sections).unwrap();
        assert_eq!(table.segments().len(), 4);
        assert!(table.get(PermissionClass::ExecuteRead).unwrap().is_empty());
    }

    fn seg(class: PermissionClass, start: u64, end: u64) -> Segment {
        Segment {
            class,
            start,
            end,
            sections: Vec::new(),
        }
    }

    const B: u64 = ion_proto::memory::KERNEL_BASE;
    const P: u64 = 0x1000;

    fn good_table() -> Vec<Segment> {
        vec![
            seg(PermissionClass::Null, B, B + P),
            seg(PermissionClass::ExecuteRead, B + 2 * P, B + 3 * P),
            seg(PermissionClass::ReadOnly, B + 4 * P, B + 4 * P + 8),
            seg(PermissionClass::ReadWrite, B + 6 * P, B + 7 * P),
        ]
    }

    #[test]
    fn validate_accepts_good_table() {
        SegmentTable::new(good_table())
            .validate(&LayoutConfig::ion())
            .unwrap();
    }

    #[test]
    fn validate_rejects_overlap() {
        let mut segments = good_table();
        segments[2].start = B + 2 * P;
        assert!(matches!(
            SegmentTable::new(segments).validate(&LayoutConfig::ion()),
            Err(LayoutError::Overlap { first: "text", second: "rodata" })
        ));
    }

    #[test]
    fn validate_rejects_missing_padding() {
        let mut segments = good_table();
        segments[3].start = B + 5 * P; // directly after rodata's page
        assert!(matches!(
            SegmentTable::new(segments).validate(&LayoutConfig::ion()),
            Err(LayoutError::Padding { first: "rodata", second: "data" })
        ));
    }

    #[test]
    fn validate_rejects_misaligned_start() {
        let mut segments = good_table();
        segments[3].start += 8;
        assert!(matches!(
            SegmentTable::new(segments).validate(&LayoutConfig::ion()),
            Err(LayoutError::Misaligned { name: "data", .. })
        ));
    }

    #[test]
    fn validate_rejects_wrong_order_and_counts() {
        let mut swapped = good_table();
        swapped.swap(2, 3);
        assert!(matches!(
            SegmentTable::new(swapped).validate(&LayoutConfig::ion()),
            Err(LayoutError::OutOfOrder(_))
        ));

        let mut missing = good_table();
        missing.pop();
        assert_eq!(
            SegmentTable::new(missing).validate(&LayoutConfig::ion()),
            Err(LayoutError::SegmentCount {
                class: PermissionClass::ReadWrite,
                count: 0
            })
        );

        let mut no_null = good_table();
        no_null.remove(0);
        assert_eq!(
            SegmentTable::new(no_null).validate(&LayoutConfig::ion()),
            Err(LayoutError::NullSegment)
        );
    }
}
