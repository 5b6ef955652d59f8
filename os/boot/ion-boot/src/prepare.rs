use crate::handoff::{Addressing, EntryContext, HandoffBuilder, entry_context};
use crate::image::KernelImage;
use crate::mapping::MappingPlan;
use crate::negotiate::{Negotiated, VideoMode, negotiate, select_framebuffer};
use crate::NegotiationError;
use alloc::vec::Vec;
use ion_proto::memory::{IDENTITY_LOW_BYTES, PHYS_LOAD};
use log::info;

/// What the firmware side knows before the kernel is examined.
#[derive(Debug, Copy, Clone)]
pub struct BootEnvironment<'e> {
    /// Physical address the kernel image is copied to.
    pub phys_load: u64,
    /// Bytes of physical memory covered by the direct and identity maps.
    pub phys_top: u64,
    /// Available video modes; the current mode first.
    pub video_modes: &'e [VideoMode],
}

impl<'e> BootEnvironment<'e> {
    #[must_use]
    pub const fn new(video_modes: &'e [VideoMode]) -> Self {
        Self {
            phys_load: PHYS_LOAD,
            phys_top: IDENTITY_LOW_BYTES,
            video_modes,
        }
    }
}

/// Everything decided before the firmware is left.
#[derive(Debug, Clone)]
pub struct BootPlan {
    pub negotiated: Negotiated,
    /// Mode to switch to, if the kernel wants video and any mode exists.
    pub video: Option<VideoMode>,
    pub mappings: MappingPlan,
}

/// Examine a kernel and plan its boot.
///
/// # Errors
/// Any [`NegotiationError`]; the bootloader must not jump after one.
pub fn prepare(kernel: &[u8], env: &BootEnvironment<'_>) -> Result<BootPlan, NegotiationError> {
    let image = KernelImage::parse(kernel)?;
    let negotiated = negotiate(&image)?;

    let video = match (negotiated.framebuffer, negotiated.any_video) {
        (Some(request), _) => select_framebuffer(&request, env.video_modes),
        (None, Some(_)) => env.video_modes.first().copied(),
        (None, None) => None,
    };
    if let Some(mode) = video {
        info!("Video mode {}: {}x{}x{}", mode.mode, mode.width, mode.height, mode.bpp);
    }

    let mappings = MappingPlan::build_for(&image, &negotiated, env.phys_load, env.phys_top)?;
    Ok(BootPlan {
        negotiated,
        video,
        mappings,
    })
}

impl BootPlan {
    /// Encode the record the bootloader places at physical `record_phys`
    /// and the state to enter the kernel with.
    ///
    /// # Errors
    /// [`NegotiationError::RecordOutsideMap`] if the record would not be
    /// reachable through the planned direct map; otherwise see
    /// [`HandoffBuilder::encode`].
    pub fn handoff(
        &self,
        builder: &HandoffBuilder,
        record_phys: u64,
    ) -> Result<(Vec<u8>, EntryContext), NegotiationError> {
        let record = builder.encode(record_phys, Addressing::of(&self.negotiated))?;
        let end = record_phys
            .checked_add(record.len() as u64)
            .ok_or(NegotiationError::Overflow)?;
        let top = self.mappings.phys_top();
        if end > top {
            return Err(NegotiationError::RecordOutsideMap {
                start: record_phys,
                end,
                top,
            });
        }
        Ok((record, entry_context(&self.negotiated, record_phys)?))
    }
}
