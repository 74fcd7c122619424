//! Frame encoding.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;

use crate::frame::Frame;

/// Default JPEG quality, matching what OpenCV-style encoders use out of the box.
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Serializes a raw frame into a compressed image.
pub trait FrameEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>>;
}

/// Baseline JPEG encoder backed by the `image` crate.
#[derive(Clone, Copy, Debug)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    /// Quality is clamped to `1..=100`.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frame.byte_len() / 8);
        ImageJpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(
                frame.pixels(),
                frame.width,
                frame.height,
                ExtendedColorType::Rgb8,
            )
            .context("encode jpeg")?;
        Ok(out)
    }
}
