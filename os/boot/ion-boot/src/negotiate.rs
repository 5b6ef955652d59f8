use crate::NegotiationError;
use crate::image::KernelImage;
use ion_proto::header::{FramebufferRequest, HeaderFlags, HeaderTag};
use ion_proto::list::TagList;
use log::{debug, info};

/// Iterator over the kernel's header tags.
///
/// Unknown identifiers are skipped. A malformed list yields one error and
/// then ends; the caller must treat that as fatal.
pub struct TagWalker<'i> {
    list: TagList<'i, KernelImage<'i>>,
}

impl<'i> TagWalker<'i> {
    #[must_use]
    pub fn new(image: &'i KernelImage<'i>) -> Self {
        Self {
            list: TagList::new(image, image.header().tags),
        }
    }
}

impl Iterator for TagWalker<'_> {
    type Item = Result<HeaderTag, NegotiationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.list.next()? {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e.into())),
            };
            match HeaderTag::decode(&raw) {
                Ok(HeaderTag::Unknown { id }) => {
                    debug!("Skipping unknown header tag {id:#x} at {:#x}", raw.addr);
                }
                Ok(tag) => return Some(Ok(tag)),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// What the kernel asked for, after validation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Negotiated {
    pub entry: u64,
    /// Initial stack pointer.
    pub stack: u64,
    pub flags: HeaderFlags,
    pub framebuffer: Option<FramebufferRequest>,
    /// Preference from the any-video tag: 0 = linear framebuffer, 1 = none.
    pub any_video: Option<u64>,
    pub unmap_null: bool,
}

impl Negotiated {
    /// Record pointers are handed over in the higher half.
    #[must_use]
    pub const fn higher_half(&self) -> bool {
        self.flags.higher_half()
    }

    /// Page tables enforce the segment permissions.
    #[must_use]
    pub const fn protected_memory(&self) -> bool {
        self.flags.protected_memory()
    }

    #[must_use]
    pub const fn wants_video(&self) -> bool {
        self.framebuffer.is_some() || self.any_video.is_some()
    }
}

/// Fold the boot header and its tags into a [`Negotiated`] request set.
///
/// When a tag appears more than once the last occurrence wins.
///
/// # Errors
/// Fails on unknown flag bits, a malformed tag list, a stack pointer that is
/// null, not 16-byte aligned or not the top of (or inside) a writable
/// segment, and an entry point outside every executable segment.
pub fn negotiate(image: &KernelImage<'_>) -> Result<Negotiated, NegotiationError> {
    let header = image.header();

    let unknown = header.flags.into_bits() & !HeaderFlags::ALL.into_bits();
    if unknown != 0 {
        return Err(NegotiationError::UnknownFlags(unknown));
    }

    let stack = header.stack;
    if stack == 0 {
        return Err(NegotiationError::NullStack);
    }
    if !stack.is_multiple_of(16) {
        return Err(NegotiationError::MisalignedStack(stack));
    }
    // The stack grows down, so its top may sit exactly at the segment end.
    let stack_ok = image
        .elf()
        .load_segments()
        .any(|ph| ph.flags.write() && stack > ph.vaddr && stack - ph.vaddr <= ph.memsz);
    if !stack_ok {
        return Err(NegotiationError::StackNotWritable(stack));
    }

    let entry = image.entry();
    if !image.segment_at(entry).is_some_and(|ph| ph.flags.execute()) {
        return Err(NegotiationError::EntryNotExecutable(entry));
    }

    let mut negotiated = Negotiated {
        entry,
        stack,
        flags: header.flags,
        framebuffer: None,
        any_video: None,
        unmap_null: false,
    };
    for tag in TagWalker::new(image) {
        match tag? {
            HeaderTag::Framebuffer(request) => negotiated.framebuffer = Some(request),
            HeaderTag::AnyVideo { preference } => negotiated.any_video = Some(preference),
            HeaderTag::UnmapNull => negotiated.unmap_null = true,
            HeaderTag::Unknown { .. } => {}
        }
    }

    info!(
        "Negotiated: higher half {}, protected memory {}, framebuffer {:?}, unmap null {}",
        negotiated.higher_half(),
        negotiated.protected_memory(),
        negotiated.framebuffer,
        negotiated.unmap_null
    );
    Ok(negotiated)
}

/// A video mode offered by the firmware.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VideoMode {
    /// Firmware mode number.
    pub mode: u32,
    pub width: u64,
    pub height: u64,
    pub bpp: u16,
}

impl VideoMode {
    const fn rank(&self) -> (u64, u16) {
        (self.width.saturating_mul(self.height), self.bpp)
    }

    const fn matches(&self, request: &FramebufferRequest) -> bool {
        (request.width == 0 || request.width == self.width)
            && (request.height == 0 || request.height == self.height)
            && (request.bpp == 0 || request.bpp == self.bpp)
    }
}

/// Pick a mode for a framebuffer request.
///
/// Zero fields match anything. The largest matching mode wins, then the
/// deepest; on a tie the mode listed first. If nothing matches, the best
/// mode overall is used. `None` only if `modes` is empty.
#[must_use]
pub fn select_framebuffer(request: &FramebufferRequest, modes: &[VideoMode]) -> Option<VideoMode> {
    let best = |candidates: &mut dyn Iterator<Item = &VideoMode>| {
        candidates
            .copied()
            .reduce(|best, m| if m.rank() > best.rank() { m } else { best })
    };

    if let Some(mode) = best(&mut modes.iter().filter(|m| m.matches(request))) {
        return Some(mode);
    }
    let fallback = best(&mut modes.iter());
    if let Some(mode) = fallback {
        debug!(
            "No mode matches {}x{}x{}; using {}x{}x{}",
            request.width, request.height, request.bpp, mode.width, mode.height, mode.bpp
        );
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fixture::*;
    use ion_proto::header::{ANY_VIDEO_ID, FRAMEBUFFER_ID, UNMAP_NULL_ID};
    use ion_proto::list::ListError;

    fn negotiate_fixture(fixture: &Fixture) -> Result<Negotiated, NegotiationError> {
        let bytes = fixture.build();
        let image = KernelImage::parse(&bytes)?;
        negotiate(&image)
    }

    #[test]
    fn zero_framebuffer_request_is_default() {
        let n = negotiate_fixture(&Fixture::default()).unwrap();
        assert!(n.framebuffer.unwrap().is_default());
        assert_eq!(n.stack, STACK_TOP);
        assert!(n.higher_half() && n.protected_memory());
        assert!(!n.unmap_null);
    }

    #[test]
    fn folds_all_known_tags_and_skips_unknown() {
        let fixture = Fixture {
            tags: vec![
                (0xdead_beef, vec![1, 2, 3]),
                (FRAMEBUFFER_ID, fb(1024, 768, 32)),
                (ANY_VIDEO_ID, 1u64.to_le_bytes().to_vec()),
                (UNMAP_NULL_ID, Vec::new()),
            ],
            ..Fixture::default()
        };
        let n = negotiate_fixture(&fixture).unwrap();
        assert_eq!(
            n.framebuffer,
            Some(FramebufferRequest {
                width: 1024,
                height: 768,
                bpp: 32
            })
        );
        assert_eq!(n.any_video, Some(1));
        assert!(n.unmap_null);
    }

    #[test]
    fn walker_reports_only_known_tags() {
        let fixture = Fixture {
            tags: vec![(0x1234, Vec::new()), (UNMAP_NULL_ID, Vec::new())],
            ..Fixture::default()
        };
        let bytes = fixture.build();
        let image = KernelImage::parse(&bytes).unwrap();
        let tags: Vec<_> = TagWalker::new(&image).collect();
        assert_eq!(tags, [Ok(HeaderTag::UnmapNull)]);
    }

    #[test]
    fn empty_tag_list_is_fine() {
        let n = negotiate_fixture(&Fixture {
            tags: Vec::new(),
            ..Fixture::default()
        })
        .unwrap();
        assert_eq!(n.framebuffer, None);
        assert!(!n.wants_video());
    }

    #[test]
    fn cyclic_list_is_fatal() {
        let mut fixture = Fixture {
            tags: vec![(FRAMEBUFFER_ID, fb(0, 0, 0)), (UNMAP_NULL_ID, Vec::new())],
            ..Fixture::default()
        };
        fixture.links = vec![(1, fixture.tag_addr(0))];
        assert!(matches!(
            negotiate_fixture(&fixture),
            Err(NegotiationError::TagList(ListError::Cycle { .. }))
        ));
    }

    #[test]
    fn dangling_reference_is_fatal() {
        let fixture = Fixture {
            links: vec![(0, DATA + 0x100)],
            ..Fixture::default()
        };
        assert_eq!(
            negotiate_fixture(&fixture),
            Err(NegotiationError::TagList(ListError::Dangling { addr: DATA + 0x100 }))
        );
    }

    #[test]
    fn truncated_framebuffer_tag_is_fatal() {
        let fixture = Fixture {
            tags: vec![(FRAMEBUFFER_ID, vec![0; 4])],
            ..Fixture::default()
        };
        assert!(matches!(
            negotiate_fixture(&fixture),
            Err(NegotiationError::TagList(ListError::Truncated { .. }))
        ));
    }

    #[test]
    fn rejects_bad_stacks() {
        let with_stack = |stack| Fixture {
            stack,
            ..Fixture::default()
        };
        assert_eq!(negotiate_fixture(&with_stack(0)), Err(NegotiationError::NullStack));
        assert_eq!(
            negotiate_fixture(&with_stack(STACK_TOP - 8)),
            Err(NegotiationError::MisalignedStack(STACK_TOP - 8))
        );
        assert_eq!(
            negotiate_fixture(&with_stack(RODATA + 0x10)),
            Err(NegotiationError::StackNotWritable(RODATA + 0x10))
        );
        assert_eq!(
            negotiate_fixture(&with_stack(STACK_TOP + 0x10)),
            Err(NegotiationError::StackNotWritable(STACK_TOP + 0x10))
        );
    }

    #[test]
    fn rejects_entry_outside_text() {
        let fixture = Fixture {
            entry: RODATA,
            ..Fixture::default()
        };
        assert_eq!(
            negotiate_fixture(&fixture),
            Err(NegotiationError::EntryNotExecutable(RODATA))
        );
    }

    #[test]
    fn rejects_unknown_flags() {
        let fixture = Fixture {
            flags: 0b101,
            ..Fixture::default()
        };
        assert_eq!(
            negotiate_fixture(&fixture),
            Err(NegotiationError::UnknownFlags(0b100))
        );
    }

    const MODES: [VideoMode; 4] = [
        VideoMode { mode: 0, width: 800, height: 600, bpp: 32 },
        VideoMode { mode: 1, width: 1024, height: 768, bpp: 24 },
        VideoMode { mode: 2, width: 1024, height: 768, bpp: 32 },
        VideoMode { mode: 3, width: 640, height: 480, bpp: 16 },
    ];

    #[test]
    fn default_request_takes_best_mode() {
        let mode = select_framebuffer(&FramebufferRequest::default(), &MODES).unwrap();
        assert_eq!(mode.mode, 2);
    }

    #[test]
    fn partial_request_constrains_only_nonzero_fields() {
        let request = FramebufferRequest {
            width: 0,
            height: 0,
            bpp: 16,
        };
        assert_eq!(select_framebuffer(&request, &MODES).unwrap().mode, 3);

        let request = FramebufferRequest {
            width: 1024,
            height: 768,
            bpp: 24,
        };
        assert_eq!(select_framebuffer(&request, &MODES).unwrap().mode, 1);
    }

    #[test]
    fn unmatched_request_falls_back_to_best() {
        let request = FramebufferRequest {
            width: 1920,
            height: 1080,
            bpp: 32,
        };
        assert_eq!(select_framebuffer(&request, &MODES).unwrap().mode, 2);
        assert_eq!(select_framebuffer(&request, &[]), None);
    }
}
