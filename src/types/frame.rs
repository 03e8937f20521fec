//! Fixed-size frame storage and the adapter trait that builds typed frames from raw bytes.

use std::fmt;

use super::FormatDescriptor;

/// Builds a strongly typed, fixed-size frame from the bytes a hardware source filled.
///
/// Implementations are pure data transformations: `from_bytes` either copies exactly
/// [`SIZE`](Self::SIZE) bytes or returns `None`. A partially filled frame never exists.
///
/// The associated constants describe the layout well enough for generic code (the
/// acquisition loop, emulators, latency buffers) to work on any format without knowing
/// its header structure.
pub trait FrameAdapter: Sized + Clone + Send + fmt::Debug + 'static {
    /// Format this adapter produces.
    const FORMAT: FormatDescriptor;

    /// Frame size in bytes.
    const SIZE: usize;

    /// Byte offset of the little-endian 64-bit timestamp.
    const TIMESTAMP_OFFSET: usize;

    /// Timestamp increment between two consecutive frames of one stream.
    const TICK_DIFF: u64;

    /// Byte offset of a one-byte channel id, for formats that multiplex several
    /// channels onto one timestamp.
    const CHANNEL_OFFSET: Option<usize> = None;

    /// Copies the first `SIZE` bytes of `bytes` into a new frame.
    ///
    /// Returns `None` when fewer than `SIZE` bytes are available. Bytes beyond `SIZE`
    /// are ignored: a fill carries at most one frame.
    fn from_bytes(bytes: &[u8]) -> Option<Self>;

    fn as_bytes(&self) -> &[u8];

    /// Timestamp in detector clock ticks.
    #[inline]
    fn timestamp(&self) -> u64 {
        read_u64_le(self.as_bytes(), Self::TIMESTAMP_OFFSET)
    }
}

/// Reads a little-endian `u64` at `offset`, or 0 if the slice is too short.
#[inline]
pub fn read_u64_le(bytes: &[u8], offset: usize) -> u64 {
    bytes.get(offset..offset + 8).and_then(|b| b.try_into().ok()).map(u64::from_le_bytes).unwrap_or(0)
}

/// Writes `value` little-endian at `offset`. Returns false if it does not fit.
#[inline]
pub fn write_u64_le(bytes: &mut [u8], offset: usize, value: u64) -> bool {
    match bytes.get_mut(offset..offset + 8) {
        Some(slot) => {
            slot.copy_from_slice(&value.to_le_bytes());
            true
        }
        None => false,
    }
}

/// Heap-allocated byte array of a compile-time size.
///
/// Frames move through queues and buffers by pointer, so large layouts
/// (several kilobytes) never sit on the stack.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame<const N: usize> {
    bytes: Box<[u8; N]>,
}

impl<const N: usize> RawFrame<N> {
    pub fn copy_from(src: &[u8]) -> Option<Self> {
        let head = src.get(..N)?;
        let bytes: Box<[u8; N]> = head.to_vec().into_boxed_slice().try_into().ok()?;
        Some(Self { bytes })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    #[inline]
    pub fn u8_at(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or(0)
    }

    #[inline]
    pub fn u16_at(&self, offset: usize) -> u16 {
        self.bytes.get(offset..offset + 2).and_then(|b| b.try_into().ok()).map(u16::from_le_bytes).unwrap_or(0)
    }

    #[inline]
    pub fn u64_at(&self, offset: usize) -> u64 {
        read_u64_le(self.as_bytes(), offset)
    }
}

impl<const N: usize> fmt::Debug for RawFrame<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawFrame<{N}>")
    }
}
