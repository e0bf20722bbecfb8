use image::{ImageBuffer, ImageReader, Rgba, RgbaImage};
use std::io::Cursor;

use crate::color::{to_channel, ColorMatrix};

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn byte_len(&self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded camera frame with capture metadata, as published by a source.
#[derive(Debug, Clone)]
pub struct TimestampedFrame {
    pub image: RgbaImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl TimestampedFrame {
    pub fn new(image: RgbaImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    /// Decode a JPEG (or any format `image` can sniff) into RGBA.
    pub fn from_jpeg(data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        let image = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgba8();
        Ok(Self::new(image, captured_at_ms, seq))
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.image.width(), self.image.height())
    }
}

/// Mutable RGBA pixel buffer rasterized once per tick.
///
/// The allocation is kept across ticks and only grows when the source
/// dimensions grow.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    dims: Dimensions,
    data: Vec<u8>,
    /// Sequence number of the source frame last drawn into this buffer.
    pub seq: u64,
    pub captured_at_ms: i64,
}

impl FrameBuffer {
    pub fn new(dims: Dimensions) -> Self {
        Self {
            dims,
            data: vec![0; dims.byte_len()],
            seq: 0,
            captured_at_ms: 0,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }

    pub fn width(&self) -> u32 {
        self.dims.width
    }

    pub fn height(&self) -> u32 {
        self.dims.height
    }

    /// Resize to `dims`, reusing the existing allocation. Returns `true` if
    /// the dimensions changed. Pixel contents are unspecified afterwards.
    pub fn resize(&mut self, dims: Dimensions) -> bool {
        if self.dims == dims {
            return false;
        }
        self.dims = dims;
        self.data.resize(dims.byte_len(), 0);
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let i = self.index(x, y)?;
        let p = &self.data[i..i + BYTES_PER_PIXEL];
        Some([p[0], p[1], p[2], p[3]])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) -> bool {
        match self.index(x, y) {
            Some(i) => {
                self.data[i..i + BYTES_PER_PIXEL].copy_from_slice(&rgba);
                true
            }
            None => false,
        }
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.dims.width || y >= self.dims.height {
            return None;
        }
        Some((y as usize * self.dims.width as usize + x as usize) * BYTES_PER_PIXEL)
    }

    /// Copy a decoded frame in, resizing to the frame's dimensions.
    pub fn copy_from_frame(&mut self, frame: &TimestampedFrame) {
        self.resize(frame.dimensions());
        self.data.copy_from_slice(frame.image.as_raw());
        self.seq = frame.seq;
        self.captured_at_ms = frame.captured_at_ms;
    }

    /// Copy raw RGBA bytes in. `rgba` must be exactly `dims.byte_len()` long.
    pub fn copy_from_rgba(&mut self, dims: Dimensions, rgba: &[u8]) -> Result<(), FrameError> {
        if rgba.len() != dims.byte_len() {
            return Err(FrameError::SizeMismatch {
                got: rgba.len(),
                expected: dims.byte_len(),
            });
        }
        self.resize(dims);
        self.data.copy_from_slice(rgba);
        Ok(())
    }

    /// Transform every pixel's RGB through `matrix`; alpha is left untouched.
    pub fn apply_matrix(&mut self, matrix: &ColorMatrix) {
        for px in self.data.chunks_exact_mut(BYTES_PER_PIXEL) {
            let [r, g, b] = matrix.apply(px[0], px[1], px[2]);
            px[0] = to_channel(r);
            px[1] = to_channel(g);
            px[2] = to_channel(b);
        }
    }

    /// Borrow the buffer as an `image` view, e.g. for encoding.
    pub fn as_image(&self) -> Option<ImageBuffer<Rgba<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.dims.width, self.dims.height, self.data.as_slice())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("pixel data has wrong length: got {got} bytes, expected {expected}")]
    SizeMismatch { got: usize, expected: usize },
}
