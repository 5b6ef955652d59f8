//! # ELF64 Reading
//!
//! A small, bounds-checked reader for 64-bit little-endian x86-64 ELF files.
//! It exposes what the boot pipeline needs and nothing more: program headers,
//! section headers resolved by name, and symbol lookup through `.symtab`.
//!
//! The `builder` module (feature `builder`) writes minimal images with the
//! same shape. It is what the layout verifier's and the negotiator's tests
//! feed to the reader.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

#[cfg(any(test, feature = "builder"))]
pub mod builder;
mod parser;

pub use parser::{Elf, FileHeader, ProgramHeader, Section, Symbol};

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_DYNAMIC: u32 = 6;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_WRITE: u64 = 0x1;
pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;

pub const EM_X86_64: u16 = 62;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ElfError {
    #[error("The file is smaller than an ELF header")]
    TooSmall,
    #[error("The file does not start with the ELF magic")]
    BadMagic,
    #[error("Only 64-bit little-endian ELF version 1 is supported")]
    UnsupportedClass,
    #[error("Unsupported machine type {0}")]
    UnsupportedMachine(u16),
    #[error("Unexpected {table} entry size {size}")]
    BadEntrySize { table: &'static str, size: u16 },
    #[error("The {0} lies outside the file")]
    OutOfBounds(&'static str),
    #[error("Section name is not a valid string")]
    BadName,
}

/// Bitfield wrapper for `Elf64_Phdr.p_flags` (32-bit)
///
/// Layout (LSB→MSB):
/// - bit 0: execute
/// - bit 1: write
/// - bit 2: read
/// - bits 3..31: reserved (must be zero for standard flags)
#[bitfield_struct::bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PFlags {
    #[bits(1)]
    pub execute: bool,
    #[bits(1)]
    pub write: bool,
    #[bits(1)]
    pub read: bool,
    #[bits(29)]
    __: u32,
}

impl PFlags {
    pub const RX: Self = Self::new().with_read(true).with_execute(true);
    pub const R: Self = Self::new().with_read(true);
    pub const RW: Self = Self::new().with_read(true).with_write(true);
    pub const RWX: Self = Self::new()
        .with_read(true)
        .with_write(true)
        .with_execute(true);
}
