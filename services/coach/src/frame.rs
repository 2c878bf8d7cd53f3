//! Camera frames as seen by the pipeline.
//!
//! Frames are produced by the capture collaborator and shared read-only across
//! detection, selection and analysis. Pixel data lives in [`Bytes`] so buffer
//! snapshots are reference-counted rather than copied.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use std::time::Instant;
use thiserror::Error;

/// JPEG quality used for inline frames.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Errors that can occur when reading or encoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame buffer too small: expected {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Frame has zero dimensions")]
    EmptyDimensions,

    #[error("JPEG encoding failed: {0}")]
    Encoding(String),
}

/// Memory layout of a frame's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Bgra8,
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// A captured camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packed pixel data, rows top to bottom without padding
    pub data: Bytes,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel format
    pub format: PixelFormat,

    /// Frame sequence number
    pub sequence: u64,

    /// Timestamp when frame was captured
    pub captured_at: Instant,
}

impl Frame {
    /// Create a frame captured now.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Number of bytes the dimensions imply.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Check that the buffer covers the declared dimensions.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyDimensions);
        }
        let expected = self.expected_len();
        if self.data.len() < expected {
            return Err(FrameError::BufferTooSmall {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Rec.601 luminance (0-255) of the pixel at `(x, y)`.
    ///
    /// Returns `None` when the coordinate falls outside the buffer.
    pub fn luminance_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let idx = (y as usize * self.width as usize + x as usize) * bpp;
        let px = self.data.get(idx..idx + bpp)?;

        let (r, g, b) = match self.format {
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => (px[0], px[1], px[2]),
            PixelFormat::Bgra8 => (px[2], px[1], px[0]),
            PixelFormat::Gray8 => return Some(px[0]),
        };

        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Some(luma.round().min(255.0) as u8)
    }

    /// Convert to tightly packed RGB24.
    fn to_rgb(&self) -> Result<Vec<u8>, FrameError> {
        self.validate()?;
        let pixels = self.width as usize * self.height as usize;
        let src = &self.data[..self.expected_len()];

        let rgb = match self.format {
            PixelFormat::Rgb8 => src.to_vec(),
            PixelFormat::Rgba8 => src
                .chunks_exact(4)
                .flat_map(|p| [p[0], p[1], p[2]])
                .collect(),
            PixelFormat::Bgra8 => src
                .chunks_exact(4)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
            PixelFormat::Gray8 => src.iter().flat_map(|&v| [v, v, v]).collect(),
        };
        debug_assert_eq!(rgb.len(), pixels * 3);
        Ok(rgb)
    }

    /// Encode the frame as JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let rgb = self.to_rgb()?;
        let mut out = Vec::with_capacity(rgb.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&rgb, self.width, self.height, ColorType::Rgb8)
            .map_err(|e| FrameError::Encoding(e.to_string()))?;
        Ok(out)
    }

    /// Encode the frame as base64 JPEG for inline transport.
    pub fn to_base64_jpeg(&self) -> Result<String, FrameError> {
        Ok(STANDARD.encode(self.to_jpeg(DEFAULT_JPEG_QUALITY)?))
    }
}
