//! Raw frame container.
//!
//! A `Frame` is what a capture source hands to the encoder: packed RGB8 pixels
//! plus the dimensions the device was configured with. Frames are read,
//! encoded and dropped within a single producer iteration; nothing retains them.

use anyhow::{anyhow, Result};

/// Bytes per pixel of the packed RGB8 layout every capture backend normalizes to.
pub const RGB_CHANNELS: usize = 3;

/// Opaque raw RGB8 frame.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap packed RGB8 pixels. The buffer length must match `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel content is never logged.
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Byte length of a packed RGB8 image, with overflow checking.
pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow: {}x{}", width, height))
}
