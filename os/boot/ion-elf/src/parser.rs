//! # ELF Header Parsing

use crate::{
    EM_X86_64, ElfError, PFlags, SHF_ALLOC, SHT_DYNAMIC, SHT_NOBITS, SHT_RELA, SHT_SYMTAB,
};
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::read_unaligned;

// Minimal ELF64 definitions
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf64Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

/// Types that are valid for any bit pattern.
///
/// # Safety
/// Implementors must be `#[repr(C)]` and consist of integers only.
unsafe trait Plain: Copy {}

unsafe impl Plain for Elf64Ehdr {}
unsafe impl Plain for Elf64Phdr {}
unsafe impl Plain for Elf64Shdr {}
unsafe impl Plain for Elf64Sym {}

fn read_at<T: Plain>(bytes: &[u8], off: usize, what: &'static str) -> Result<T, ElfError> {
    let end = off
        .checked_add(size_of::<T>())
        .ok_or(ElfError::OutOfBounds(what))?;
    if end > bytes.len() {
        return Err(ElfError::OutOfBounds(what));
    }
    // SAFETY: bounds checked above; read_unaligned has no alignment requirement
    // and `Plain` types accept any bit pattern.
    Ok(unsafe { read_unaligned(bytes.as_ptr().add(off).cast::<T>()) })
}

fn range<'b>(
    bytes: &'b [u8],
    offset: u64,
    size: u64,
    what: &'static str,
) -> Result<&'b [u8], ElfError> {
    let start = usize::try_from(offset).map_err(|_| ElfError::OutOfBounds(what))?;
    let len = usize::try_from(size).map_err(|_| ElfError::OutOfBounds(what))?;
    let end = start.checked_add(len).ok_or(ElfError::OutOfBounds(what))?;
    bytes.get(start..end).ok_or(ElfError::OutOfBounds(what))
}

fn c_str(table: &[u8], offset: u32) -> Result<&str, ElfError> {
    let tail = table.get(offset as usize..).ok_or(ElfError::BadName)?;
    let end = tail.iter().position(|&b| b == 0).ok_or(ElfError::BadName)?;
    core::str::from_utf8(&tail[..end]).map_err(|_| ElfError::BadName)
}

/// The parts of the file header the boot pipeline looks at.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FileHeader {
    pub elf_type: u16,
    pub machine: u16,
    pub entry: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: PFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    /// `true` if `addr` lies within `[vaddr, vaddr + memsz)`.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr - self.vaddr < self.memsz
    }

    /// One past the last in-memory byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.vaddr.saturating_add(self.memsz)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Section<'a> {
    pub name: &'a str,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub entsize: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Symbol<'a> {
    pub name: &'a str,
    pub value: u64,
    pub size: u64,
}

/// A parsed ELF64 image borrowing the file bytes.
#[derive(Debug)]
pub struct Elf<'a> {
    bytes: &'a [u8],
    header: FileHeader,
    program_headers: Vec<ProgramHeader>,
    sections: Vec<Section<'a>>,
}

impl<'a> Elf<'a> {
    const EI_MAGIC_BYTES: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    /// Parse a 64-bit little-endian x86-64 ELF image.
    ///
    /// # Errors
    /// Any validation or bounds failure is reported as an [`ElfError`].
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < size_of::<Elf64Ehdr>() {
            return Err(ElfError::TooSmall);
        }
        let ehdr: Elf64Ehdr = read_at(bytes, 0, "file header")?;

        // Validate magic 0x7F 'E''L''F'
        if ehdr.e_ident[0..4] != Self::EI_MAGIC_BYTES {
            return Err(ElfError::BadMagic);
        }
        // Class = 2 (ELF64), Data = 1 (little-endian), Version = 1
        if ehdr.e_ident[4] != 2 || ehdr.e_ident[5] != 1 || ehdr.e_ident[6] != 1 {
            return Err(ElfError::UnsupportedClass);
        }
        if ehdr.e_machine != EM_X86_64 {
            return Err(ElfError::UnsupportedMachine(ehdr.e_machine));
        }

        let program_headers = Self::program_headers_of(bytes, &ehdr)?;
        let sections = Self::sections_of(bytes, &ehdr)?;

        Ok(Self {
            bytes,
            header: FileHeader {
                elf_type: ehdr.e_type,
                machine: ehdr.e_machine,
                entry: ehdr.e_entry,
            },
            program_headers,
            sections,
        })
    }

    fn program_headers_of(bytes: &[u8], ehdr: &Elf64Ehdr) -> Result<Vec<ProgramHeader>, ElfError> {
        if ehdr.e_phnum == 0 {
            return Ok(Vec::new());
        }
        if ehdr.e_phentsize as usize != size_of::<Elf64Phdr>() {
            return Err(ElfError::BadEntrySize {
                table: "program header",
                size: ehdr.e_phentsize,
            });
        }

        let phoff = usize::try_from(ehdr.e_phoff)
            .map_err(|_| ElfError::OutOfBounds("program header table"))?;
        let phentsize = ehdr.e_phentsize as usize;

        (0..ehdr.e_phnum as usize)
            .map(|i| {
                let off = i
                    .checked_mul(phentsize)
                    .and_then(|o| o.checked_add(phoff))
                    .ok_or(ElfError::OutOfBounds("program header table"))?;
                let ph: Elf64Phdr = read_at(bytes, off, "program header table")?;
                Ok(ProgramHeader {
                    p_type: ph.p_type,
                    flags: PFlags::from_bits(ph.p_flags),
                    offset: ph.p_offset,
                    vaddr: ph.p_vaddr,
                    paddr: ph.p_paddr,
                    filesz: ph.p_filesz,
                    memsz: ph.p_memsz,
                    align: ph.p_align,
                })
            })
            .collect()
    }

    fn sections_of<'b>(bytes: &'b [u8], ehdr: &Elf64Ehdr) -> Result<Vec<Section<'b>>, ElfError> {
        if ehdr.e_shoff == 0 || ehdr.e_shnum == 0 {
            return Ok(Vec::new());
        }
        if ehdr.e_shentsize as usize != size_of::<Elf64Shdr>() {
            return Err(ElfError::BadEntrySize {
                table: "section header",
                size: ehdr.e_shentsize,
            });
        }

        let shoff = usize::try_from(ehdr.e_shoff)
            .map_err(|_| ElfError::OutOfBounds("section header table"))?;
        let shentsize = ehdr.e_shentsize as usize;
        let raw = (0..ehdr.e_shnum as usize)
            .map(|i| {
                let off = i
                    .checked_mul(shentsize)
                    .and_then(|o| o.checked_add(shoff))
                    .ok_or(ElfError::OutOfBounds("section header table"))?;
                read_at::<Elf64Shdr>(bytes, off, "section header table")
            })
            .collect::<Result<Vec<_>, _>>()?;

        let strtab = raw
            .get(ehdr.e_shstrndx as usize)
            .ok_or(ElfError::OutOfBounds("section name table"))?;
        let names = range(bytes, strtab.sh_offset, strtab.sh_size, "section name table")?;

        raw.iter()
            .map(|sh| {
                Ok(Section {
                    name: c_str(names, sh.sh_name)?,
                    sh_type: sh.sh_type,
                    flags: sh.sh_flags,
                    addr: sh.sh_addr,
                    offset: sh.sh_offset,
                    size: sh.sh_size,
                    link: sh.sh_link,
                    entsize: sh.sh_entsize,
                })
            })
            .collect()
    }

    #[must_use]
    pub const fn header(&self) -> &FileHeader {
        &self.header
    }

    #[must_use]
    pub const fn entry(&self) -> u64 {
        self.header.entry
    }

    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[must_use]
    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    /// `PT_LOAD` program headers in file order.
    pub fn load_segments(&self) -> impl Iterator<Item = &ProgramHeader> {
        self.program_headers
            .iter()
            .filter(|ph| ph.p_type == crate::PT_LOAD)
    }

    #[must_use]
    pub fn sections(&self) -> &[Section<'a>] {
        &self.sections
    }

    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section<'a>> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// File bytes backing `section`. `SHT_NOBITS` sections have none.
    ///
    /// # Errors
    /// Fails if the section's range lies outside the file.
    pub fn section_data(&self, section: &Section<'_>) -> Result<&'a [u8], ElfError> {
        if section.sh_type == SHT_NOBITS {
            return Ok(&[]);
        }
        range(self.bytes, section.offset, section.size, "section data")
    }

    /// File bytes backing a program header (`filesz` bytes from `offset`).
    ///
    /// # Errors
    /// Fails if the segment's range lies outside the file.
    pub fn segment_data(&self, ph: &ProgramHeader) -> Result<&'a [u8], ElfError> {
        range(self.bytes, ph.offset, ph.filesz, "segment data")
    }

    /// The first allocated, non-empty section the dynamic loader would
    /// process (`SHT_RELA` or `SHT_DYNAMIC`). A static executable has none.
    #[must_use]
    pub fn dynamic_section(&self) -> Option<&Section<'a>> {
        self.sections.iter().find(|s| {
            matches!(s.sh_type, SHT_RELA | SHT_DYNAMIC) && s.flags & SHF_ALLOC != 0 && s.size > 0
        })
    }

    #[must_use]
    pub fn has_symbols(&self) -> bool {
        self.sections.iter().any(|s| s.sh_type == SHT_SYMTAB)
    }

    /// Look up `name` in `.symtab`. Returns `Ok(None)` if there is no
    /// symbol table or no such symbol.
    ///
    /// # Errors
    /// Fails if the symbol or string table is malformed.
    pub fn symbol(&self, name: &str) -> Result<Option<Symbol<'a>>, ElfError> {
        let Some(symtab) = self.sections.iter().find(|s| s.sh_type == SHT_SYMTAB) else {
            return Ok(None);
        };
        let strtab = self
            .sections
            .get(symtab.link as usize)
            .ok_or(ElfError::OutOfBounds("symbol name table"))?;
        let names = self.section_data(strtab)?;
        let table = self.section_data(symtab)?;

        for off in (0..table.len()).step_by(size_of::<Elf64Sym>()) {
            let sym: Elf64Sym = read_at(table, off, "symbol table")?;
            if sym.st_name == 0 {
                continue;
            }
            if c_str(names, sym.st_name)? == name {
                return Ok(Some(Symbol {
                    name: c_str(names, sym.st_name)?,
                    value: sym.st_value,
                    size: sym.st_size,
                }));
            }
        }
        Ok(None)
    }
}
