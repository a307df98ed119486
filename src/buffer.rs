//! Buffer types moved across pads.
//!
//! A [`Buffer`] owns its payload through [`Bytes`], so cloning or slicing is
//! cheap and never copies data. Ownership of a buffer moves into every
//! push/chain call.

use crate::clock::ClockTime;
use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Per-buffer flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Data is not contiguous with the previous buffer.
        const DISCONT = 1 << 0;
        /// Buffer carries no meaningful data (filler).
        const GAP = 1 << 1;
        /// Buffer cannot be decoded on its own.
        const DELTA_UNIT = 1 << 2;
        /// Buffer holds stream headers.
        const HEADER = 1 << 3;
    }
}

impl Default for BufferFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A chunk of media data with timing information.
///
/// # Example
///
/// ```rust
/// use padflow::buffer::Buffer;
/// use padflow::clock::ClockTime;
///
/// let buffer = Buffer::from_slice(b"hello").with_pts(ClockTime::from_millis(40));
/// assert_eq!(buffer.len(), 5);
/// assert_eq!(buffer.pts(), Some(ClockTime::from_millis(40)));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Buffer {
    data: Bytes,
    pts: Option<ClockTime>,
    duration: Option<ClockTime>,
    offset: Option<u64>,
    flags: BufferFlags,
}

impl Buffer {
    /// Create a buffer owning `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Create a buffer by copying a slice.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// Create a zero-filled buffer.
    pub fn with_size(size: usize) -> Self {
        Self::new(vec![0u8; size])
    }

    /// Builder-style presentation timestamp setter.
    pub fn with_pts(mut self, pts: ClockTime) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Builder-style duration setter.
    pub fn with_duration(mut self, duration: ClockTime) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Builder-style media offset setter.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Builder-style flags setter.
    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The payload as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Take the payload out of the buffer.
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> Option<ClockTime> {
        self.pts
    }

    /// Set the presentation timestamp.
    pub fn set_pts(&mut self, pts: Option<ClockTime>) {
        self.pts = pts;
    }

    /// Duration.
    pub fn duration(&self) -> Option<ClockTime> {
        self.duration
    }

    /// Set the duration.
    pub fn set_duration(&mut self, duration: Option<ClockTime>) {
        self.duration = duration;
    }

    /// Media-specific offset (byte offset for byte streams).
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Set the media offset.
    pub fn set_offset(&mut self, offset: Option<u64>) {
        self.offset = offset;
    }

    /// Flags.
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// Add flags.
    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags.insert(flags);
    }

    /// Remove flags.
    pub fn unset_flags(&mut self, flags: BufferFlags) {
        self.flags.remove(flags);
    }

    /// Shorten the payload to at most `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// A view into part of the payload, keeping the metadata.
    ///
    /// # Panics
    ///
    /// Panics if `offset + len > self.len()`.
    pub fn slice(&self, offset: usize, len: usize) -> Buffer {
        Buffer {
            data: self.data.slice(offset..offset + len),
            ..self.clone()
        }
    }
}

/// An ordered group of buffers pushed in one call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferList {
    buffers: Vec<Buffer>,
}

impl BufferList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer.
    pub fn push(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the list has no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total payload size of all buffers.
    pub fn total_size(&self) -> usize {
        self.buffers.iter().map(Buffer::len).sum()
    }

    /// Iterate over the buffers.
    pub fn iter(&self) -> std::slice::Iter<'_, Buffer> {
        self.buffers.iter()
    }

    /// Iterate mutably over the buffers.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Buffer> {
        self.buffers.iter_mut()
    }
}

impl FromIterator<Buffer> for BufferList {
    fn from_iter<I: IntoIterator<Item = Buffer>>(iter: I) -> Self {
        Self {
            buffers: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for BufferList {
    type Item = Buffer;
    type IntoIter = std::vec::IntoIter<Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_creation() {
        let buffer = Buffer::with_size(1024).with_offset(42);
        assert_eq!(buffer.len(), 1024);
        assert_eq!(buffer.offset(), Some(42));
        assert_eq!(buffer.pts(), None);
    }

    #[test]
    fn test_buffer_clone_is_cheap() {
        let buffer = Buffer::with_size(1024);
        let buffer2 = buffer.clone();

        // Both should point to the same memory
        assert_eq!(buffer.as_slice().as_ptr(), buffer2.as_slice().as_ptr());
    }

    #[test]
    fn test_buffer_slice() {
        let buffer = Buffer::from_slice(b"0123456789").with_flags(BufferFlags::DISCONT);
        let sub = buffer.slice(2, 3);

        assert_eq!(sub.as_slice(), b"234");
        assert!(sub.flags().contains(BufferFlags::DISCONT));
    }

    #[test]
    fn test_truncate() {
        let mut buffer = Buffer::with_size(100);
        buffer.truncate(10);
        assert_eq!(buffer.len(), 10);
        buffer.truncate(50);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_buffer_list() {
        let list: BufferList = (0..3).map(|_| Buffer::with_size(8)).collect();
        assert_eq!(list.len(), 3);
        assert_eq!(list.total_size(), 24);
    }

    #[test]
    #[should_panic]
    fn test_buffer_slice_out_of_bounds() {
        let buffer = Buffer::with_size(10);
        let _ = buffer.slice(8, 4);
    }
}
