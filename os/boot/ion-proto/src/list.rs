//! # Tag List Walking
//!
//! Both the kernel's header tags and the bootloader's struct tags are singly
//! linked lists with the same framing:
//!
//! ```text
//! offset  size  field
//! 0       8     identifier
//! 8       8     next (address of the next tag, 0 terminates the list)
//! 16      ..    type specific payload
//! ```
//!
//! The list carries no length. The only termination rule is a null `next`,
//! so the walker has to defend itself against lists that never reach one:
//! a reference that points outside readable memory is reported as
//! [`ListError::Dangling`], a reference that loops back is reported as
//! [`ListError::Cycle`] (Brent's algorithm, no allocation), and a list longer
//! than [`MAX_TAGS`] is reported as [`ListError::TooLong`].

/// Size of the `{identifier, next}` framing in front of every tag.
pub const TAG_HEADER_SIZE: usize = 16;

/// Upper bound on the number of tags a list may contain.
pub const MAX_TAGS: usize = 256;

/// Errors raised while walking a tag list.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ListError {
    #[error("tag reference {addr:#x} does not point into readable memory")]
    Dangling { addr: u64 },
    #[error("tag at {addr:#x} is not 8-byte aligned")]
    Misaligned { addr: u64 },
    #[error("tag at {addr:#x} is truncated (needs {needed} bytes, {available} available)")]
    Truncated {
        addr: u64,
        needed: usize,
        available: usize,
    },
    #[error("tag list loops back to {addr:#x}")]
    Cycle { addr: u64 },
    #[error("tag list exceeds {MAX_TAGS} entries")]
    TooLong,
}

/// A view of memory addressed the same way the tag references are.
pub trait TagMemory {
    /// Returns the bytes from `addr` up to the end of the region containing it,
    /// or `None` if `addr` is not readable.
    fn bytes_from(&self, addr: u64) -> Option<&[u8]>;
}

/// A single contiguous byte slice living at `base`.
#[derive(Debug, Copy, Clone)]
pub struct SliceMemory<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> SliceMemory<'a> {
    #[must_use]
    pub const fn new(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl TagMemory for SliceMemory<'_> {
    fn bytes_from(&self, addr: u64) -> Option<&[u8]> {
        let off = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        self.bytes.get(off..).filter(|rest| !rest.is_empty())
    }
}

/// One undecoded tag as found in memory.
#[derive(Debug, Copy, Clone)]
pub struct RawTag<'m> {
    /// Address the tag was found at.
    pub addr: u64,
    /// Type identifier.
    pub id: u64,
    /// Address of the next tag, `0` for the last one.
    pub next: u64,
    /// Bytes following the framing, up to the end of the containing region.
    pub payload: &'m [u8],
}

impl<'m> RawTag<'m> {
    /// Returns the first `len` payload bytes, or [`ListError::Truncated`].
    ///
    /// # Errors
    /// Fails if fewer than `len` bytes follow the framing.
    pub fn take(&self, len: usize) -> Result<&'m [u8], ListError> {
        self.payload.get(..len).ok_or(ListError::Truncated {
            addr: self.addr,
            needed: TAG_HEADER_SIZE + len,
            available: TAG_HEADER_SIZE + self.payload.len(),
        })
    }
}

/// Iterator over a tag list starting at `head`.
///
/// Yields `Err` at most once; iteration stops after an error.
pub struct TagList<'m, M: TagMemory + ?Sized> {
    mem: &'m M,
    next: u64,
    count: usize,
    // Brent's cycle detection state.
    tortoise: Option<u64>,
    power: usize,
    lam: usize,
    failed: bool,
}

impl<'m, M: TagMemory + ?Sized> TagList<'m, M> {
    #[must_use]
    pub const fn new(mem: &'m M, head: u64) -> Self {
        Self {
            mem,
            next: head,
            count: 0,
            tortoise: None,
            power: 1,
            lam: 0,
            failed: false,
        }
    }

    fn visit(&mut self, addr: u64) -> Result<RawTag<'m>, ListError> {
        if self.tortoise == Some(addr) {
            return Err(ListError::Cycle { addr });
        }
        if self.lam == self.power {
            self.tortoise = Some(addr);
            self.power *= 2;
            self.lam = 0;
        }
        self.lam += 1;

        self.count += 1;
        if self.count > MAX_TAGS {
            return Err(ListError::TooLong);
        }

        if !addr.is_multiple_of(8) {
            return Err(ListError::Misaligned { addr });
        }

        let bytes = self
            .mem
            .bytes_from(addr)
            .ok_or(ListError::Dangling { addr })?;
        if bytes.len() < TAG_HEADER_SIZE {
            return Err(ListError::Truncated {
                addr,
                needed: TAG_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        Ok(RawTag {
            addr,
            id: read_u64_le(bytes, 0),
            next: read_u64_le(bytes, 8),
            payload: &bytes[TAG_HEADER_SIZE..],
        })
    }
}

impl<'m, M: TagMemory + ?Sized> Iterator for TagList<'m, M> {
    type Item = Result<RawTag<'m>, ListError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next == 0 {
            return None;
        }

        let addr = self.next;
        match self.visit(addr) {
            Ok(tag) => {
                self.next = tag.next;
                Some(Ok(tag))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Read a little-endian `u64` at `off`. The caller guarantees the bounds.
#[inline]
pub(crate) fn read_u64_le(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Read a little-endian `u16` at `off`. The caller guarantees the bounds.
#[inline]
pub(crate) fn read_u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}
