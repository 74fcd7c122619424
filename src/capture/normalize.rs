use anyhow::{anyhow, Context, Result};

use crate::frame::{rgb_len, Frame};

/// Pixel layouts a V4L2 driver may settle on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Result<Self> {
        match fourcc {
            b"RGB3" => Ok(Self::Rgb24),
            b"YUYV" => Ok(Self::Yuyv),
            b"MJPG" | b"JPEG" => Ok(Self::Mjpeg),
            other => Err(anyhow!(
                "unsupported pixel format {}",
                String::from_utf8_lossy(other)
            )),
        }
    }
}

/// Convert a captured buffer into a packed RGB8 `Frame`.
pub(crate) fn normalize_to_frame(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Frame> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = rgb_len(width, height)?;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            // Drivers may pad the last buffer; only the image area is kept.
            Frame::new(pixels[..expected].to_vec(), width, height)
        }
        PixelFormat::Yuyv => Frame::new(yuyv_to_rgb(pixels, width, height)?, width, height),
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory(pixels).context("decode mjpeg frame")?;
            let rgb = image.into_rgb8();
            let (w, h) = rgb.dimensions();
            Frame::new(rgb.into_raw(), w, h)
        }
    }
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    if w % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", width));
    }
    let expected = w
        .checked_mul(h)
        .and_then(|v| v.checked_mul(2))
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(rgb_len(width, height)?);
    // Each 4-byte group carries two pixels sharing one chroma pair.
    for group in pixels[..expected].chunks_exact(4) {
        let u = group[1] as f32 - 128.0;
        let v = group[3] as f32 - 128.0;
        for y in [group[0], group[2]] {
            let y = y as f32;
            rgb.push(clamp_to_u8(y + 1.402_f32 * v));
            rgb.push(clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v));
            rgb.push(clamp_to_u8(y + 1.772_f32 * u));
        }
    }
    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
