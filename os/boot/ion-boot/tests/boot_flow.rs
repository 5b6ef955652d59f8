//! End to end: kernel bytes in, handoff record and entry state out.

use ion_boot::{BootEnvironment, HandoffBuilder, NegotiationError, VideoMode, prepare};
use ion_elf::builder::{ElfBuilder, SectionSpec, SegmentSpec};
use ion_elf::{
    ET_DYN, PFlags, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_PROGBITS, SHT_RELA,
};
use ion_proto::header::{FRAMEBUFFER_ID, HeaderFlags, UNMAP_NULL_ID};
use ion_proto::info::{BootInfoView, FramebufferInfo, MemoryKind, MemoryMapEntry, StructTag};
use ion_proto::list::SliceMemory;
use ion_proto::memory::{HHDM_BASE, KERNEL_BASE, PAGE_SIZE, is_higher_half, is_lower_half};

const TEXT: u64 = KERNEL_BASE + 2 * PAGE_SIZE;
const RODATA: u64 = KERNEL_BASE + 4 * PAGE_SIZE;
const DATA: u64 = KERNEL_BASE + 6 * PAGE_SIZE;
const STACK_TOP: u64 = DATA + 0x4000;
const RECORD_PHYS: u64 = 0x7f0_0000;

const MODES: [VideoMode; 2] = [
    VideoMode { mode: 0, width: 800, height: 600, bpp: 32 },
    VideoMode { mode: 7, width: 1280, height: 1024, bpp: 32 },
];

/// A kernel requesting a default framebuffer and an unmapped null page.
fn kernel(flags: HeaderFlags) -> Vec<u8> {
    let tags = RODATA + 32;
    let unmap = tags + 16 + 24;

    let mut rodata = Vec::new();
    for v in [TEXT, STACK_TOP, flags.into_bits(), tags] {
        rodata.extend_from_slice(&v.to_le_bytes());
    }
    for v in [FRAMEBUFFER_ID, unmap, 0, 0] {
        rodata.extend_from_slice(&v.to_le_bytes());
    }
    rodata.extend_from_slice(&[0; 8]); // bpp + padding
    for v in [UNMAP_NULL_ID, 0] {
        rodata.extend_from_slice(&v.to_le_bytes());
    }
    let len = rodata.len() as u64;

    ElfBuilder::new(TEXT)
        .segment(SegmentSpec::null(0, 0))
        .segment(SegmentSpec::load(TEXT, 0x20_2000, PFlags::RX, vec![0xf4; 0x40]))
        .segment(SegmentSpec::load(RODATA, 0x20_4000, PFlags::R, rodata))
        .segment(SegmentSpec::load(DATA, 0x20_6000, PFlags::RW, Vec::new()).memsz(0x4000))
        .section(SectionSpec::new(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, TEXT, 0x40))
        .section(SectionSpec::new(".ionhdr", SHT_PROGBITS, SHF_ALLOC, RODATA, 32))
        .section(SectionSpec::new(".rodata", SHT_PROGBITS, SHF_ALLOC, RODATA + 32, len - 32))
        .section(SectionSpec::new(".bss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE, DATA, 0x4000))
        .symbol("ion_main", TEXT)
        .build()
}

fn handoff_builder() -> HandoffBuilder {
    HandoffBuilder::new()
        .memory(MemoryMapEntry {
            base: 0x10_0000,
            length: 0x700_0000,
            kind: MemoryKind::Usable,
        })
        .framebuffer(FramebufferInfo {
            addr: 0xc000_0000,
            width: 1280,
            height: 1024,
            pitch: 5120,
            bpp: 32,
            memory_model: 1,
            red_mask_size: 8,
            red_mask_shift: 16,
            green_mask_size: 8,
            green_mask_shift: 8,
            blue_mask_size: 8,
            blue_mask_shift: 0,
        })
        .module(0x100_0000, 0x100_1000, "initrd")
        .cmdline("verbose")
}

/// Addresses of every tag, plus the pointers tags carry.
fn record_addresses(record: &[u8], at: u64) -> Vec<u64> {
    let mem = SliceMemory::new(at, record);
    let view = BootInfoView::new(&mem, at).expect("record prefix");
    let mut out = vec![view.head()];
    for tag in view.tags() {
        match tag.expect("well formed record") {
            StructTag::Framebuffer(fb) => out.push(fb.addr),
            StructTag::Modules(modules) => {
                out.extend(modules.iter().flat_map(|m| [m.begin, m.end]));
            }
            StructTag::Cmdline { addr } => {
                assert_eq!(view.string_at(addr), Some("verbose"));
                out.push(addr);
            }
            _ => {}
        }
    }
    out
}

#[test]
fn higher_half_kernel_gets_higher_half_record() {
    let bytes = kernel(HeaderFlags::ALL);
    let plan = prepare(&bytes, &BootEnvironment::new(&MODES)).unwrap();
    assert_eq!(plan.video, Some(MODES[1]));
    assert_eq!(plan.mappings.translate(0), None);

    let (record, entry) = plan.handoff(&handoff_builder(), RECORD_PHYS).unwrap();
    assert_eq!(entry.entry_point, TEXT);
    assert_eq!(entry.stack_top, STACK_TOP);
    assert_eq!(entry.boot_info, HHDM_BASE + RECORD_PHYS);
    assert!(!entry.interrupts_enabled);

    let addresses = record_addresses(&record, entry.boot_info);
    assert_eq!(addresses.len(), 5);
    assert!(addresses.iter().all(|&a| is_higher_half(a)), "{addresses:#x?}");
    // The record pointer itself must resolve through the direct map.
    assert_eq!(plan.mappings.translate(entry.boot_info), Some(RECORD_PHYS));
}

#[test]
fn low_kernel_gets_physical_record() {
    let bytes = kernel(HeaderFlags::new().with_protected_memory(true));
    let plan = prepare(&bytes, &BootEnvironment::new(&MODES)).unwrap();
    let (record, entry) = plan.handoff(&handoff_builder(), RECORD_PHYS).unwrap();
    assert_eq!(entry.boot_info, RECORD_PHYS);

    let addresses = record_addresses(&record, entry.boot_info);
    assert!(addresses.iter().all(|&a| is_lower_half(a)), "{addresses:#x?}");
}

#[test]
fn no_video_modes_means_no_framebuffer() {
    let bytes = kernel(HeaderFlags::ALL);
    let plan = prepare(&bytes, &BootEnvironment::new(&[])).unwrap();
    assert_eq!(plan.video, None);
}

#[test]
fn corrupt_kernel_never_reaches_handoff() {
    let mut bytes = kernel(HeaderFlags::ALL);
    bytes[0] = 0;
    assert!(matches!(
        prepare(&bytes, &BootEnvironment::new(&MODES)),
        Err(NegotiationError::Elf(_))
    ));
}

#[test]
fn record_must_fit_below_the_mapped_top() {
    let bytes = kernel(HeaderFlags::ALL);
    let env = BootEnvironment {
        phys_top: RECORD_PHYS + PAGE_SIZE,
        ..BootEnvironment::new(&MODES)
    };
    let plan = prepare(&bytes, &env).unwrap();
    let (record, _) = plan.handoff(&handoff_builder(), RECORD_PHYS).unwrap();
    assert!(record.len() as u64 <= PAGE_SIZE);

    // Straddles the top of the direct map.
    let last = RECORD_PHYS + PAGE_SIZE - 8;
    assert_eq!(
        plan.handoff(&handoff_builder(), last).unwrap_err(),
        NegotiationError::RecordOutsideMap {
            start: last,
            end: last + record.len() as u64,
            top: RECORD_PHYS + PAGE_SIZE
        }
    );
    // Entirely above it.
    assert!(matches!(
        plan.handoff(&handoff_builder(), 0x1_0000_0000),
        Err(NegotiationError::RecordOutsideMap { .. })
    ));
}

#[test]
fn position_independent_kernel_is_refused_before_negotiation() {
    // What a static-pie link produces: the header's stack and tag pointers
    // are zero in the file and only filled in by `.rela.dyn`.
    let mut rodata = Vec::new();
    for v in [TEXT, 0, HeaderFlags::ALL.into_bits(), 0] {
        rodata.extend_from_slice(&v.to_le_bytes());
    }
    rodata.resize(32 + 48, 0);
    let bytes = ElfBuilder::new(TEXT)
        .elf_type(ET_DYN)
        .segment(SegmentSpec::null(0, 0))
        .segment(SegmentSpec::load(TEXT, 0x20_2000, PFlags::RX, vec![0xf4; 0x40]))
        .segment(SegmentSpec::load(RODATA, 0x20_4000, PFlags::R, rodata))
        .segment(SegmentSpec::load(DATA, 0x20_6000, PFlags::RW, Vec::new()).memsz(0x4000))
        .section(SectionSpec::new(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, TEXT, 0x40))
        .section(SectionSpec::new(".ionhdr", SHT_PROGBITS, SHF_ALLOC, RODATA, 32))
        .section(SectionSpec::new(".rela.dyn", SHT_RELA, SHF_ALLOC, RODATA + 32, 48))
        .section(SectionSpec::new(".bss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE, DATA, 0x4000))
        .symbol("ion_main", TEXT)
        .build();
    assert_eq!(
        prepare(&bytes, &BootEnvironment::new(&MODES)).unwrap_err(),
        NegotiationError::NotExecutable(ET_DYN)
    );
}
