use crate::NegotiationError;
use crate::image::KernelImage;
use crate::negotiate::Negotiated;
use alloc::vec::Vec;
use ion_elf::PFlags;
use ion_proto::memory::{
    HHDM_BASE, IDENTITY_LOW_BYTES, KERNEL_BASE, PAGE_SIZE, align_down, checked_align_up,
};
use log::debug;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MappingKind {
    /// A kernel `PT_LOAD` segment.
    Kernel,
    /// Higher-half direct map of physical memory.
    Hhdm,
    /// Low identity map, so the switch code keeps running after the `cr3` load.
    Identity,
}

/// One page-aligned virtual range backed by contiguous physical memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mapping {
    pub virt: u64,
    pub phys: u64,
    pub len: u64,
    pub perms: PFlags,
    pub kind: MappingKind,
}

impl Mapping {
    #[must_use]
    pub const fn contains(&self, virt: u64) -> bool {
        virt >= self.virt && virt - self.virt < self.len
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.virt + self.len
    }
}

/// The address space the kernel is entered in.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MappingPlan {
    mappings: Vec<Mapping>,
}

impl MappingPlan {
    /// Plan the mappings for a negotiated kernel loaded at `phys_load`,
    /// direct-mapping the low [`IDENTITY_LOW_BYTES`] of physical memory.
    ///
    /// # Errors
    /// See [`MappingPlan::build_for`].
    pub fn build(
        image: &KernelImage<'_>,
        negotiated: &Negotiated,
        phys_load: u64,
    ) -> Result<Self, NegotiationError> {
        Self::build_for(image, negotiated, phys_load, IDENTITY_LOW_BYTES)
    }

    /// Plan the mappings with `phys_top` bytes of physical memory in the
    /// direct and identity maps.
    ///
    /// Kernel segments keep their link addresses; their physical location is
    /// `phys_load + (vaddr - KERNEL_BASE)`. With protected memory they get the
    /// `p_flags` permissions, otherwise read+write+execute.
    ///
    /// # Errors
    /// Fails if a segment lies below [`KERNEL_BASE`] or two segments share a
    /// page, and with [`NegotiationError::Overflow`] if a segment or the
    /// direct map runs past the end of the address space.
    pub fn build_for(
        image: &KernelImage<'_>,
        negotiated: &Negotiated,
        phys_load: u64,
        phys_top: u64,
    ) -> Result<Self, NegotiationError> {
        let mut mappings = Vec::new();

        let identity_start = if negotiated.unmap_null { PAGE_SIZE } else { 0 };
        let phys_top = checked_align_up(phys_top, PAGE_SIZE)
            .filter(|&top| HHDM_BASE.checked_add(top).is_some())
            .ok_or(NegotiationError::Overflow)?;
        if phys_top > identity_start {
            mappings.push(Mapping {
                virt: identity_start,
                phys: identity_start,
                len: phys_top - identity_start,
                perms: PFlags::RWX,
                kind: MappingKind::Identity,
            });
        }
        mappings.push(Mapping {
            virt: HHDM_BASE,
            phys: 0,
            len: phys_top,
            perms: PFlags::RW,
            kind: MappingKind::Hhdm,
        });

        let mut kernel: Vec<Mapping> = Vec::new();
        for ph in image.elf().load_segments() {
            if ph.vaddr < KERNEL_BASE {
                return Err(NegotiationError::SegmentOutsideKernel(ph.vaddr));
            }
            let end = ph.vaddr.checked_add(ph.memsz).ok_or(NegotiationError::Overflow)?;
            let virt = align_down(ph.vaddr, PAGE_SIZE);
            let len = checked_align_up(end, PAGE_SIZE).ok_or(NegotiationError::Overflow)? - virt;
            let phys = phys_load
                .checked_add(virt - KERNEL_BASE)
                .ok_or(NegotiationError::Overflow)?;
            let perms = if negotiated.protected_memory() {
                ph.flags.with_read(true)
            } else {
                PFlags::RWX
            };
            let mapping = Mapping {
                virt,
                phys,
                len,
                perms,
                kind: MappingKind::Kernel,
            };

            if let Some(other) = kernel
                .iter()
                .find(|m| mapping.virt < m.end() && m.virt < mapping.end())
            {
                return Err(NegotiationError::OverlappingSegments {
                    first: other.virt,
                    second: mapping.virt,
                });
            }
            debug!(
                "Kernel {:#x}..{:#x} -> {:#x} (r{}w{}x{})",
                mapping.virt,
                mapping.end(),
                mapping.phys,
                u8::from(perms.read()),
                u8::from(perms.write()),
                u8::from(perms.execute())
            );
            kernel.push(mapping);
        }
        mappings.extend(kernel);

        Ok(Self { mappings })
    }

    #[must_use]
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// The mapping that resolves `virt`. Kernel mappings shadow the others.
    #[must_use]
    pub fn lookup(&self, virt: u64) -> Option<&Mapping> {
        self.mappings.iter().rev().find(|m| m.contains(virt))
    }

    /// Physical address `virt` resolves to, `None` if unmapped.
    #[must_use]
    pub fn translate(&self, virt: u64) -> Option<u64> {
        self.lookup(virt).map(|m| m.phys + (virt - m.virt))
    }

    pub fn kernel(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter().filter(|m| m.kind == MappingKind::Kernel)
    }

    /// End of the physical range reachable through the direct map.
    #[must_use]
    pub fn phys_top(&self) -> u64 {
        self.mappings
            .iter()
            .find(|m| m.kind == MappingKind::Hhdm)
            .map_or(0, |m| m.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fixture::*;
    use crate::negotiate::negotiate;
    use ion_elf::builder::{ElfBuilder, SectionSpec, SegmentSpec};
    use ion_elf::{SHF_ALLOC, SHT_PROGBITS};
    use ion_proto::header::{FRAMEBUFFER_ID, HeaderFlags, UNMAP_NULL_ID};
    use ion_proto::memory::PHYS_LOAD;

    fn plan(fixture: &Fixture) -> MappingPlan {
        let bytes = fixture.build();
        let image = KernelImage::parse(&bytes).unwrap();
        let negotiated = negotiate(&image).unwrap();
        MappingPlan::build(&image, &negotiated, PHYS_LOAD).unwrap()
    }

    #[test]
    fn protected_kernel_gets_segment_permissions() {
        let plan = plan(&Fixture::default());
        let kernel: Vec<_> = plan.kernel().collect();
        assert_eq!(kernel.len(), 3);
        assert_eq!(kernel[0].perms, PFlags::RX);
        assert_eq!(kernel[1].perms, PFlags::R);
        assert_eq!(kernel[2].perms, PFlags::RW);
        assert_eq!(plan.translate(TEXT), Some(PHYS_LOAD + 2 * PAGE_SIZE));
        assert_eq!(plan.translate(DATA + 0x10), Some(PHYS_LOAD + 6 * PAGE_SIZE + 0x10));
    }

    #[test]
    fn unprotected_kernel_is_fully_permissive() {
        let plan = plan(&Fixture {
            flags: HeaderFlags::new().with_higher_half(true).into_bits(),
            ..Fixture::default()
        });
        assert!(plan.kernel().all(|m| m.perms == PFlags::RWX));
    }

    #[test]
    fn padding_pages_stay_unmapped() {
        let plan = plan(&Fixture::default());
        assert_eq!(plan.translate(KERNEL_BASE), None);
        assert_eq!(plan.translate(TEXT - 1), None);
        assert_eq!(plan.translate(RODATA - 1), None);
    }

    #[test]
    fn direct_map_covers_low_memory() {
        let plan = plan(&Fixture::default());
        assert_eq!(plan.translate(HHDM_BASE + 0x1234), Some(0x1234));
        let hhdm = plan.lookup(HHDM_BASE).unwrap();
        assert_eq!(hhdm.kind, MappingKind::Hhdm);
        assert!(!hhdm.perms.execute());
        assert_eq!(plan.translate(0), Some(0));
    }

    #[test]
    fn segment_at_top_of_address_space_overflows() {
        let fixture = Fixture::default().build();
        let negotiated = negotiate(&KernelImage::parse(&fixture).unwrap()).unwrap();

        // Ends inside the last page, so its page-rounded end does not fit.
        let bytes = ElfBuilder::new(TEXT)
            .segment(SegmentSpec::load(u64::MAX - 0x10, 0, PFlags::R, vec![0; 8]))
            .section(SectionSpec::new(".ionhdr", SHT_PROGBITS, SHF_ALLOC, 0, 32))
            .build();
        let image = KernelImage::parse(&bytes).unwrap();
        assert_eq!(
            MappingPlan::build(&image, &negotiated, PHYS_LOAD).unwrap_err(),
            NegotiationError::Overflow
        );
    }

    #[test]
    fn direct_map_past_address_space_overflows() {
        let bytes = Fixture::default().build();
        let image = KernelImage::parse(&bytes).unwrap();
        let negotiated = negotiate(&image).unwrap();
        for top in [u64::MAX, u64::MAX - HHDM_BASE + 1] {
            assert_eq!(
                MappingPlan::build_for(&image, &negotiated, PHYS_LOAD, top).unwrap_err(),
                NegotiationError::Overflow
            );
        }
        let plan = MappingPlan::build_for(&image, &negotiated, PHYS_LOAD, 0x1234_5001).unwrap();
        assert_eq!(plan.phys_top(), 0x1234_6000);
    }

    #[test]
    fn unmap_null_leaves_page_zero_unmapped() {
        let plan = plan(&Fixture {
            tags: vec![(FRAMEBUFFER_ID, fb(0, 0, 0)), (UNMAP_NULL_ID, Vec::new())],
            ..Fixture::default()
        });
        assert_eq!(plan.translate(0), None);
        assert_eq!(plan.translate(PAGE_SIZE - 1), None);
        assert_eq!(plan.translate(PAGE_SIZE), Some(PAGE_SIZE));
    }
}
