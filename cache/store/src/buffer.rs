//! Immutable decoded-frame buffers.

use bytes::Bytes;

/// Channel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// 8-bit blue/green/red, 3 bytes per pixel.
    Bgr8,
    /// 8-bit red/green/blue, 3 bytes per pixel.
    Rgb8,
    /// 8-bit red/green/blue/alpha, 4 bytes per pixel.
    Rgba8,
    /// 8-bit grayscale, 1 byte per pixel.
    Gray8,
}

impl PixelLayout {
    /// Bytes per pixel for this layout.
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgr8 | Self::Rgb8 => 3,
            Self::Rgba8 => 4,
            Self::Gray8 => 1,
        }
    }
}

/// One decoded display-resolution frame.
///
/// The payload is immutable. Cloning is cheap (the pixel data is
/// refcounted), which is how borrows hand pixels out without holding any
/// cache lock.
///
/// `byte_size` is the loader-declared decoded size and is authoritative
/// for cache accounting; the cache never recomputes it from the payload.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: Bytes,
    width: u32,
    height: u32,
    layout: PixelLayout,
    byte_size: usize,
}

impl FrameBuffer {
    /// Create a buffer whose accounted size is the payload length.
    pub fn new(width: u32, height: u32, layout: PixelLayout, data: Bytes) -> Self {
        let byte_size = data.len();
        Self {
            data,
            width,
            height,
            layout,
            byte_size,
        }
    }

    /// Override the accounted byte size with the loader's figure.
    ///
    /// Decoders that hold pixels in padded or pooled storage report the
    /// true resident footprint here.
    pub fn with_byte_size(mut self, byte_size: usize) -> Self {
        self.byte_size = byte_size;
        self
    }

    /// Frame width in pixels.
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Channel layout.
    #[inline]
    pub const fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Loader-declared decoded size in bytes.
    #[inline]
    pub const fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// The pixel payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_defaults_to_payload_len() {
        let buffer = FrameBuffer::new(4, 2, PixelLayout::Bgr8, vec![0u8; 24].into());
        assert_eq!(buffer.byte_size(), 24);
        assert_eq!(buffer.data().len(), 24);
    }

    #[test]
    fn test_declared_byte_size_is_authoritative() {
        let buffer =
            FrameBuffer::new(4, 2, PixelLayout::Bgr8, vec![0u8; 24].into()).with_byte_size(64);
        assert_eq!(buffer.byte_size(), 64);
        assert_eq!(buffer.data().len(), 24);
    }

    #[test]
    fn test_clone_shares_payload() {
        let buffer = FrameBuffer::new(2, 2, PixelLayout::Gray8, vec![7u8; 4].into());
        let clone = buffer.clone();
        assert_eq!(clone.data().as_ptr(), buffer.data().as_ptr());
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(PixelLayout::Bgr8.bytes_per_pixel(), 3);
        assert_eq!(PixelLayout::Rgb8.bytes_per_pixel(), 3);
        assert_eq!(PixelLayout::Rgba8.bytes_per_pixel(), 4);
        assert_eq!(PixelLayout::Gray8.bytes_per_pixel(), 1);
    }
}
