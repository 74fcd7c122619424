//! V4L2 capture source.
//!
//! `V4l2Source` drives a local device node (e.g. /dev/video0) through libv4l with
//! memory-mapped buffers. RGB3 is requested; when the driver settles on YUYV or
//! MJPG instead, frames are normalized to RGB8 after capture.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_frame, PixelFormat};
use super::{CaptureSettings, CaptureSource};
use crate::frame::Frame;

const STREAM_BUFFERS: u32 = 4;

pub struct V4l2Source {
    device_path: String,
    device: Option<v4l::Device>,
    state: Option<DeviceStreamState>,
    pixel_format: PixelFormat,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceStreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            device: None,
            state: None,
            pixel_format: PixelFormat::Rgb24,
            active_width: 0,
            active_height: 0,
        }
    }

    fn read_active_format(&mut self) -> Result<()> {
        use v4l::video::Capture;

        let device = self
            .device
            .as_ref()
            .context("v4l2 device not open")?;
        let format = device.format().context("read v4l2 format")?;
        self.pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr)?;
        self.active_width = format.width;
        self.active_height = format.height;
        Ok(())
    }

    /// Move the device into a streaming state. Formats are fixed from here on.
    fn start_stream(&mut self) -> Result<()> {
        use v4l::buffer::Type;

        if self.active_width == 0 {
            self.read_active_format()?;
        }
        let device = self.device.take().context("v4l2 device not open")?;
        let state = DeviceStreamStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: streaming {} ({}x{}, {:?})",
            self.device_path,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }
}

impl CaptureSource for V4l2Source {
    fn open(&mut self) -> Result<()> {
        let device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;
        self.device = Some(device);
        Ok(())
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<()> {
        use v4l::video::Capture;

        if self.state.is_some() {
            return Err(anyhow!(
                "v4l2 device {} is already streaming",
                self.device_path
            ));
        }
        let device = self
            .device
            .as_mut()
            .context("v4l2 device not open")?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        if let Err(err) = device.set_format(&format) {
            log::warn!(
                "V4l2Source: failed to set format on {}: {}",
                self.device_path,
                err
            );
        }

        if settings.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.device_path,
                    err
                );
            }
        }

        self.read_active_format()?;
        if self.active_width != settings.width || self.active_height != settings.height {
            log::warn!(
                "V4l2Source: {} settled on {}x{} instead of {}x{}",
                self.device_path,
                self.active_width,
                self.active_height,
                settings.width,
                settings.height
            );
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some() || self.state.is_some()
    }

    fn read(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        if self.state.is_none() {
            self.start_stream()?;
        }
        let width = self.active_width;
        let height = self.active_height;
        let pixel_format = self.pixel_format;
        let state = self.state.as_mut().context("v4l2 device not streaming")?;
        state.with_mut(|fields| {
            let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            normalize_to_frame(&buf[..used], width, height, pixel_format)
        })
    }

    fn device(&self) -> &str {
        &self.device_path
    }
}
