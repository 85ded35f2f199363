//! Pixel formats known to the partial-flush bookkeeping.

/// Pixel format of a shared buffer.
///
/// Only the bytes-per-pixel figure matters to this crate: it converts a row
/// stride in pixels into the byte stride used for sub-rectangle cache
/// flushes. Planar YUV formats report zero, which makes unlock fall back to
/// flushing the whole mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// RGBA, 8 bits per channel, 32 bits per pixel.
    #[default]
    Rgba8888,
    /// RGBX, 8 bits per channel, alpha ignored.
    Rgbx8888,
    /// BGRA, 8 bits per channel.
    Bgra8888,
    /// RGB, 8 bits per channel, 24 bits per pixel.
    Rgb888,
    /// RGB 5:6:5, 16 bits per pixel.
    Rgb565,
    /// RGBA 5:5:5:1, 16 bits per pixel.
    Rgba5551,
    /// RGBA 4:4:4:4, 16 bits per pixel.
    Rgba4444,
    /// YUV 4:2:0 planar (Y plane, then V, then U).
    Yv12,
    /// YUV 4:2:0 semi-planar (Y plane, then interleaved UV).
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel, or 0 for planar formats.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 | PixelFormat::Rgba5551 | PixelFormat::Rgba4444 => 2,
            PixelFormat::Yv12 | PixelFormat::Nv12 => 0,
        }
    }
}
