//! # ELF Image Builder
//!
//! Writes minimal ELF64 executables: program headers with their payload,
//! section headers pointing into that payload, and an optional `.symtab`.
//! Section data is taken from whichever segment covers the section address.

use crate::{EM_X86_64, ET_EXEC, PFlags, PT_LOAD, PT_NULL, SHT_NOBITS, SHT_STRTAB, SHT_SYMTAB};
use alloc::string::String;
use alloc::vec::Vec;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const PAGE: usize = 4096;
const SHN_ABS: u16 = 0xfff1;

#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub p_type: u32,
    pub flags: PFlags,
    pub vaddr: u64,
    pub paddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
}

impl SegmentSpec {
    /// A `PT_LOAD` segment whose memory size equals its file size.
    #[must_use]
    pub fn load(vaddr: u64, paddr: u64, flags: PFlags, data: Vec<u8>) -> Self {
        Self {
            p_type: PT_LOAD,
            flags,
            vaddr,
            paddr,
            memsz: data.len() as u64,
            data,
        }
    }

    /// The zero-permission `PT_NULL` guard segment at `vaddr`.
    #[must_use]
    pub fn null(vaddr: u64, memsz: u64) -> Self {
        Self {
            p_type: PT_NULL,
            flags: PFlags::new(),
            vaddr,
            paddr: 0,
            data: Vec::new(),
            memsz,
        }
    }

    /// Extend the in-memory size beyond the file data (zero-filled tail).
    #[must_use]
    pub fn memsz(mut self, memsz: u64) -> Self {
        self.memsz = memsz;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub size: u64,
}

impl SectionSpec {
    #[must_use]
    pub fn new(name: &str, sh_type: u32, flags: u64, addr: u64, size: u64) -> Self {
        Self {
            name: String::from(name),
            sh_type,
            flags,
            addr,
            size,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ElfBuilder {
    elf_type: u16,
    entry: u64,
    segments: Vec<SegmentSpec>,
    sections: Vec<SectionSpec>,
    symbols: Vec<(String, u64)>,
}

impl ElfBuilder {
    #[must_use]
    pub fn new(entry: u64) -> Self {
        Self {
            elf_type: ET_EXEC,
            entry,
            ..Self::default()
        }
    }

    /// Override `e_type` (`ET_EXEC` by default).
    #[must_use]
    pub const fn elf_type(mut self, elf_type: u16) -> Self {
        self.elf_type = elf_type;
        self
    }

    #[must_use]
    pub fn segment(mut self, segment: SegmentSpec) -> Self {
        self.segments.push(segment);
        self
    }

    #[must_use]
    pub fn section(mut self, section: SectionSpec) -> Self {
        self.sections.push(section);
        self
    }

    #[must_use]
    pub fn symbol(mut self, name: &str, value: u64) -> Self {
        self.symbols.push((String::from(name), value));
        self
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut out = alloc::vec![0u8; phoff + PHDR_SIZE * self.segments.len()];

        // Segment payloads, congruent to their vaddr modulo the page size.
        let mut seg_offsets = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            if seg.data.is_empty() {
                seg_offsets.push(0);
                continue;
            }
            let off = out.len().next_multiple_of(PAGE) + (seg.vaddr as usize % PAGE);
            out.resize(off, 0);
            out.extend_from_slice(&seg.data);
            seg_offsets.push(off);
        }

        // Section names: null, user sections, [.symtab, .strtab], .shstrtab.
        let mut shstrtab = alloc::vec![0u8];
        let mut name_of = |name: &str| {
            let at = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            at
        };

        let mut headers: Vec<[u8; SHDR_SIZE]> = alloc::vec![[0u8; SHDR_SIZE]];
        for s in &self.sections {
            let offset = if s.sh_type == SHT_NOBITS {
                0
            } else {
                self.file_offset(&seg_offsets, s.addr)
            };
            headers.push(shdr(name_of(&s.name), s.sh_type, s.flags, s.addr, offset, s.size, 0, 0));
        }

        let symbols = if self.symbols.is_empty() {
            None
        } else {
            let mut strtab = alloc::vec![0u8];
            let mut symtab = alloc::vec![0u8; SYM_SIZE];
            for (name, value) in &self.symbols {
                let st_name = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);

                symtab.extend_from_slice(&st_name.to_le_bytes());
                symtab.push(0x12); // STB_GLOBAL | STT_FUNC
                symtab.push(0);
                symtab.extend_from_slice(&SHN_ABS.to_le_bytes());
                symtab.extend_from_slice(&value.to_le_bytes());
                symtab.extend_from_slice(&0u64.to_le_bytes());
            }
            Some((name_of(".symtab"), symtab, name_of(".strtab"), strtab))
        };
        let shstrtab_name = name_of(".shstrtab");

        if let Some((symtab_name, symtab, strtab_name, strtab)) = symbols {
            let strtab_index = (headers.len() + 1) as u32;
            let off = append_aligned(&mut out, &symtab);
            headers.push(shdr(symtab_name, SHT_SYMTAB, 0, 0, off, symtab.len() as u64, strtab_index, SYM_SIZE as u64));
            let off = append_aligned(&mut out, &strtab);
            headers.push(shdr(strtab_name, SHT_STRTAB, 0, 0, off, strtab.len() as u64, 0, 0));
        }

        let shstrndx = headers.len() as u16;
        let off = append_aligned(&mut out, &shstrtab);
        headers.push(shdr(shstrtab_name, SHT_STRTAB, 0, 0, off, shstrtab.len() as u64, 0, 0));

        let shoff = append_aligned(&mut out, &headers.concat());

        // File header.
        let eh = &mut out[..EHDR_SIZE];
        eh[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        eh[4] = 2; // ELFCLASS64
        eh[5] = 1; // ELFDATA2LSB
        eh[6] = 1; // EV_CURRENT
        put(eh, 16, &self.elf_type.to_le_bytes());
        put(eh, 18, &EM_X86_64.to_le_bytes());
        put(eh, 20, &1u32.to_le_bytes());
        put(eh, 24, &self.entry.to_le_bytes());
        put(eh, 32, &(phoff as u64).to_le_bytes());
        put(eh, 40, &shoff.to_le_bytes());
        put(eh, 52, &(EHDR_SIZE as u16).to_le_bytes());
        put(eh, 54, &(PHDR_SIZE as u16).to_le_bytes());
        put(eh, 56, &(self.segments.len() as u16).to_le_bytes());
        put(eh, 58, &(SHDR_SIZE as u16).to_le_bytes());
        put(eh, 60, &(headers.len() as u16).to_le_bytes());
        put(eh, 62, &shstrndx.to_le_bytes());

        // Program headers.
        for (i, (seg, off)) in self.segments.iter().zip(&seg_offsets).enumerate() {
            let ph = &mut out[phoff + i * PHDR_SIZE..phoff + (i + 1) * PHDR_SIZE];
            put(ph, 0, &seg.p_type.to_le_bytes());
            put(ph, 4, &seg.flags.into_bits().to_le_bytes());
            put(ph, 8, &(*off as u64).to_le_bytes());
            put(ph, 16, &seg.vaddr.to_le_bytes());
            put(ph, 24, &seg.paddr.to_le_bytes());
            put(ph, 32, &(seg.data.len() as u64).to_le_bytes());
            put(ph, 40, &seg.memsz.to_le_bytes());
            put(ph, 48, &(PAGE as u64).to_le_bytes());
        }

        out
    }

    fn file_offset(&self, seg_offsets: &[usize], addr: u64) -> u64 {
        self.segments
            .iter()
            .zip(seg_offsets)
            .find(|(seg, _)| addr >= seg.vaddr && addr - seg.vaddr < seg.data.len() as u64)
            .map_or(0, |(seg, off)| *off as u64 + (addr - seg.vaddr))
    }
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

fn append_aligned(out: &mut Vec<u8>, bytes: &[u8]) -> u64 {
    let off = out.len().next_multiple_of(8);
    out.resize(off, 0);
    out.extend_from_slice(bytes);
    off as u64
}

#[allow(clippy::too_many_arguments)]
fn shdr(
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    entsize: u64,
) -> [u8; SHDR_SIZE] {
    let mut h = [0u8; SHDR_SIZE];
    put(&mut h, 0, &name.to_le_bytes());
    put(&mut h, 4, &sh_type.to_le_bytes());
    put(&mut h, 8, &flags.to_le_bytes());
    put(&mut h, 16, &addr.to_le_bytes());
    put(&mut h, 24, &offset.to_le_bytes());
    put(&mut h, 32, &size.to_le_bytes());
    put(&mut h, 40, &link.to_le_bytes());
    put(&mut h, 48, &8u64.to_le_bytes());
    put(&mut h, 56, &entsize.to_le_bytes());
    h
}
