//! Decoded image handles

use bytes::Bytes;

/// A decoded RGBA frame produced by a [`SegmentDecoder`](crate::decode::SegmentDecoder).
///
/// The pixel buffer is reference counted; it is released when the last record
/// holding it is dropped, so evicting a record from a cache frees the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    data: Bytes,
}

impl DecodedImage {
    /// Wrap decoded pixels.
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self { width, height, data: data.into() }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw pixel bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Size of the pixel buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}
