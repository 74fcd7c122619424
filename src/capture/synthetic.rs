//! Synthetic `stub://` capture source.
//!
//! Generates a moving gradient at the configured geometry. Used by tests and for
//! running the server on machines without a camera.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{CaptureSettings, CaptureSource};
use crate::frame::{rgb_len, Frame};

pub struct SyntheticSource {
    device: String,
    settings: CaptureSettings,
    open: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(device: &str, settings: CaptureSettings) -> Self {
        Self {
            device: device.to_string(),
            settings,
            open: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn generate_pixels(&self) -> Result<Vec<u8>> {
        let width = self.settings.width as usize;
        let mut pixels = vec![0u8; rgb_len(self.settings.width, self.settings.height)?];
        let shift = self.frame_count as usize;
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            px[0] = ((x + shift) % 256) as u8;
            px[1] = (y % 256) as u8;
            px[2] = ((x + y + shift * 2) % 256) as u8;
        }
        Ok(pixels)
    }

    /// Hold reads to the configured rate, like a real sensor would.
    fn wait_for_next_frame(&self) {
        if self.settings.fps == 0 {
            return;
        }
        let interval = Duration::from_millis(1000 / self.settings.fps as u64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!("SyntheticSource: opened {}", self.device);
        Ok(())
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<()> {
        if settings.width == 0 || settings.height == 0 {
            return Err(anyhow!(
                "invalid synthetic geometry {}x{}",
                settings.width,
                settings.height
            ));
        }
        self.settings = *settings;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("synthetic source {} not opened", self.device));
        }
        self.wait_for_next_frame();
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let pixels = self.generate_pixels()?;
        Frame::new(pixels, self.settings.width, self.settings.height)
    }

    fn device(&self) -> &str {
        &self.device
    }
}
