//! What the bootloader handed over, summarised for the debug log.

use ion_proto::info::{BootInfoView, FramebufferInfo, MemoryKind, StructTag};
use ion_proto::list::{ListError, TagMemory};
use log::{info, warn};

/// Summary of one handoff record.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct BootReport<'m> {
    pub brand: Option<&'m str>,
    pub version: Option<&'m str>,
    pub memory_regions: usize,
    /// Bytes of [`MemoryKind::Usable`] memory, saturating at `u64::MAX`.
    pub usable_bytes: u64,
    pub framebuffer: Option<FramebufferInfo>,
    pub modules: usize,
    pub cmdline: Option<&'m str>,
    pub hhdm: Option<u64>,
    /// Set if the tag list was malformed; tags before the fault are counted.
    pub fault: Option<ListError>,
}

impl<'m> BootReport<'m> {
    #[must_use]
    pub fn collect<M: TagMemory + ?Sized>(view: &BootInfoView<'m, M>) -> Self {
        let mut report = Self {
            brand: view.brand(),
            version: view.version(),
            ..Self::default()
        };
        for tag in view.tags() {
            match tag {
                Ok(StructTag::MemoryMap(map)) => {
                    report.memory_regions += map.len();
                    report.usable_bytes = map
                        .iter()
                        .filter(|e| e.kind == MemoryKind::Usable)
                        .map(|e| e.length)
                        .fold(report.usable_bytes, u64::saturating_add);
                }
                Ok(StructTag::Framebuffer(fb)) => report.framebuffer = Some(fb),
                Ok(StructTag::Modules(modules)) => report.modules += modules.len(),
                Ok(StructTag::Cmdline { addr }) => report.cmdline = view.string_at(addr),
                Ok(StructTag::Hhdm { addr }) => report.hhdm = Some(addr),
                Ok(StructTag::Unknown { .. }) => {}
                Err(e) => report.fault = Some(e),
            }
        }
        report
    }

    pub fn log(&self) {
        info!(
            "Booted by {} {}",
            self.brand.unwrap_or("?"),
            self.version.unwrap_or("?")
        );
        info!(
            "Memory: {} regions, {} KiB usable",
            self.memory_regions,
            self.usable_bytes / 1024
        );
        if let Some(fb) = &self.framebuffer {
            info!(
                "Framebuffer {}x{}x{} at {:#x}, pitch {}",
                fb.width, fb.height, fb.bpp, fb.addr, fb.pitch
            );
        }
        info!("Modules: {}", self.modules);
        if let Some(cmdline) = self.cmdline {
            info!("Command line: {cmdline}");
        }
        if let Some(hhdm) = self.hhdm {
            info!("Direct map at {hhdm:#x}");
        }
        if let Some(fault) = &self.fault {
            warn!("Boot record is malformed: {fault}");
        }
    }
}
