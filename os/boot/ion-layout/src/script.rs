use crate::{LayoutConfig, LayoutError, PermissionClass};
use alloc::string::String;
use core::fmt::{self, Write};
use ion_proto::header::HEADER_SIZE;

/// The GNU ld / LLD linker script for a [`LayoutConfig`].
///
/// Every invariant the bootloader relies on is repeated as an `ASSERT`, so a
/// kernel that violates one fails to link instead of failing to boot.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkerScript(String);

impl LinkerScript {
    /// # Errors
    /// Fails if `config` does not validate.
    pub fn render(config: &LayoutConfig) -> Result<Self, LayoutError> {
        config.validate()?;
        let mut out = String::new();
        // Writing into a `String` cannot fail.
        let _ = write_script(&mut out, config);
        Ok(Self(out))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkerScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn pflags_expr(class: PermissionClass) -> String {
    let flags = class.pflags();
    let mut bits = String::new();
    for (set, bit) in [(flags.execute(), 0), (flags.write(), 1), (flags.read(), 2)] {
        if set {
            if !bits.is_empty() {
                bits.push_str(" | ");
            }
            let _ = write!(bits, "(1 << {bit})");
        }
    }
    if bits.is_empty() {
        bits.push('0');
    }
    bits
}

fn write_script(out: &mut String, config: &LayoutConfig) -> fmt::Result {
    let header = config.header_section;
    let entry = config.entry_symbol;

    writeln!(out, "/* Generated by ion-layout; do not edit. */")?;
    writeln!(out, "OUTPUT_FORMAT(elf64-x86-64)")?;
    writeln!(out, "OUTPUT_ARCH(i386:x86-64)")?;
    writeln!(out, "ENTRY({entry})")?;
    writeln!(out)?;
    writeln!(out, "KERNEL_BASE = {:#x};", config.kernel_base)?;
    writeln!(out, "PHYS_LOAD = {:#x};", config.phys_load)?;
    writeln!(out, "PAGE_SIZE = {:#x};", config.page_size)?;
    writeln!(out)?;

    writeln!(out, "PHDRS")?;
    writeln!(out, "{{")?;
    for class in [PermissionClass::Null]
        .into_iter()
        .chain(PermissionClass::LOADED)
    {
        let kind = if class == PermissionClass::Null { "PT_NULL" } else { "PT_LOAD" };
        writeln!(
            out,
            "    {:<7} {kind} FLAGS({});",
            class.segment_name(),
            pflags_expr(class)
        )?;
    }
    writeln!(out, "}}")?;
    writeln!(out)?;

    writeln!(out, "SECTIONS")?;
    writeln!(out, "{{")?;
    writeln!(out, "    /* Null guard page, never mapped. */")?;
    writeln!(out, "    . = KERNEL_BASE;")?;
    writeln!(out, "    __ion_null_start = .;")?;
    writeln!(out, "    . += PAGE_SIZE;")?;
    writeln!(out, "    __ion_null_end = .;")?;
    writeln!(out)?;

    writeln!(out, "    . = ALIGN(PAGE_SIZE) + PAGE_SIZE;")?;
    writeln!(out, "    __ion_text_start = .;")?;
    writeln!(out, "    .text : AT(ADDR(.text) - KERNEL_BASE + PHYS_LOAD) {{")?;
    writeln!(out, "        *(.text.{entry})")?;
    writeln!(out, "        *(.text .text.*)")?;
    writeln!(out, "    }} :text")?;
    writeln!(out, "    __ion_text_end = .;")?;
    writeln!(out)?;

    writeln!(out, "    . = ALIGN(PAGE_SIZE) + PAGE_SIZE;")?;
    writeln!(out, "    __ion_rodata_start = .;")?;
    writeln!(out, "    {header} : AT(ADDR({header}) - KERNEL_BASE + PHYS_LOAD) {{")?;
    writeln!(out, "        KEEP(*({header}))")?;
    writeln!(out, "    }} :rodata")?;
    writeln!(out, "    .rodata : AT(ADDR(.rodata) - KERNEL_BASE + PHYS_LOAD) {{")?;
    writeln!(out, "        *(.rodata .rodata.*)")?;
    writeln!(out, "    }} :rodata")?;
    writeln!(out, "    .rela.dyn : AT(ADDR(.rela.dyn) - KERNEL_BASE + PHYS_LOAD) {{")?;
    writeln!(out, "        __ion_rela_start = .;")?;
    writeln!(out, "        *(.rela.dyn .rela.*)")?;
    writeln!(out, "        __ion_rela_end = .;")?;
    writeln!(out, "    }} :rodata")?;
    writeln!(out, "    __ion_rodata_end = .;")?;
    writeln!(out)?;

    writeln!(out, "    . = ALIGN(PAGE_SIZE) + PAGE_SIZE;")?;
    writeln!(out, "    __ion_data_start = .;")?;
    writeln!(out, "    .data : AT(ADDR(.data) - KERNEL_BASE + PHYS_LOAD) {{")?;
    writeln!(out, "        *(.data .data.*)")?;
    writeln!(out, "        *(.got .got.plt)")?;
    writeln!(out, "    }} :data")?;
    writeln!(out, "    .bss (NOLOAD) : AT(ADDR(.bss) - KERNEL_BASE + PHYS_LOAD) {{")?;
    writeln!(out, "        *(COMMON)")?;
    writeln!(out, "        *(.bss .bss.*)")?;
    writeln!(out, "    }} :data")?;
    writeln!(out, "    __ion_data_end = .;")?;
    writeln!(out)?;

    writeln!(out, "    /DISCARD/ : {{")?;
    writeln!(out, "        *(.eh_frame*)")?;
    writeln!(out, "        *(.note .note.*)")?;
    writeln!(out, "        *(.comment)")?;
    writeln!(out, "    }}")?;
    writeln!(out, "}}")?;
    writeln!(out)?;

    writeln!(
        out,
        "ASSERT(SIZEOF({header}) == {HEADER_SIZE}, \"{header} must hold exactly one {HEADER_SIZE}-byte boot header\");"
    )?;
    writeln!(
        out,
        "ASSERT(ADDR({header}) == __ion_rodata_start, \"{header} must lead the read-only segment\");"
    )?;
    for (prev, next) in [("null", "text"), ("text", "rodata"), ("rodata", "data")] {
        writeln!(
            out,
            "ASSERT(__ion_{next}_start >= ALIGN(__ion_{prev}_end, PAGE_SIZE) + PAGE_SIZE, \"{prev} and {next} overlap or lack a padding page\");"
        )?;
    }
    writeln!(
        out,
        "ASSERT(__ion_rela_end == __ion_rela_start, \"kernel must be linked without load-time relocations (static, non-PIE)\");"
    )?;
    writeln!(
        out,
        "ASSERT({entry} >= __ion_text_start && {entry} < __ion_text_end, \"{entry} must be in the text segment\");"
    )?;
    Ok(())
}
