//! Frame capture sources.
//!
//! This module provides the camera side of the server:
//! - `stub://` synthetic source (testing, demos)
//! - Local V4L2 device nodes (feature: capture-v4l2)
//! - Upstream HTTP cameras such as an ESP32-S3 serving JPEG/MJPEG (feature: capture-http)
//!
//! All sources produce packed RGB8 `Frame`s. The `Camera` session owns exactly one
//! source for the lifetime of the process and is shared by every stream connection.

#[cfg(feature = "capture-http")]
pub mod http;
#[cfg(any(feature = "capture-v4l2", test))]
mod normalize;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Mutex};

use crate::frame::Frame;

#[cfg(feature = "capture-http")]
pub use http::HttpCameraSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Source;

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_FPS: u32 = 30;

/// Requested capture geometry and rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
        }
    }
}

/// A camera driver.
///
/// `open` acquires the device, `configure` applies the requested geometry (drivers
/// may settle on something else), `read` blocks until the next frame is available.
pub trait CaptureSource: Send {
    fn open(&mut self) -> Result<()>;

    fn configure(&mut self, settings: &CaptureSettings) -> Result<()>;

    fn is_open(&self) -> bool;

    fn read(&mut self) -> Result<Frame>;

    /// Human-readable device identifier for logs and `/health`.
    fn device(&self) -> &str;
}

/// Build the capture source for a device string.
///
/// - `stub://<name>` selects the synthetic source
/// - `http://` / `https://` selects an upstream HTTP camera
/// - anything else is a V4L2 device node; a bare index `N` means `/dev/videoN`
pub fn source_for_device(device: &str, settings: &CaptureSettings) -> Result<Box<dyn CaptureSource>> {
    if device.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(device, *settings)));
    }
    if device.starts_with("http://") || device.starts_with("https://") {
        #[cfg(feature = "capture-http")]
        {
            return Ok(Box::new(HttpCameraSource::new(device, settings.fps)?));
        }
        #[cfg(not(feature = "capture-http"))]
        {
            return Err(anyhow!(
                "HTTP camera '{}' requires the capture-http feature",
                device
            ));
        }
    }
    let path = device_path(device);
    #[cfg(feature = "capture-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(path)))
    }
    #[cfg(not(feature = "capture-v4l2"))]
    {
        Err(anyhow!(
            "V4L2 device '{}' requires the capture-v4l2 feature",
            path
        ))
    }
}

fn device_path(device: &str) -> String {
    match device.trim().parse::<u32>() {
        Ok(index) => format!("/dev/video{}", index),
        Err(_) => device.trim().to_string(),
    }
}

/// Camera session shared by all stream connections.
pub type SharedCamera = Arc<Mutex<Camera>>;

/// The process-wide capture session.
///
/// Opened once at startup. If the device cannot be opened the session stays closed
/// for the rest of the process: there is no reopen, and every `read` fails.
pub struct Camera {
    source: Option<Box<dyn CaptureSource>>,
    device: String,
    settings: CaptureSettings,
    frames_read: u64,
}

impl Camera {
    /// Resolve `device` to a backend, open and configure it. Never fails; an open
    /// failure is logged and leaves the camera closed.
    pub fn connect(device: &str, settings: CaptureSettings) -> Self {
        log::info!("attempting to open camera {}", device);
        match source_for_device(device, &settings) {
            Ok(source) => Self::with_source(source, settings),
            Err(err) => {
                log::error!("could not open camera {}: {:#}", device, err);
                Self::closed(device, settings)
            }
        }
    }

    /// Open and configure an already constructed source.
    pub fn with_source(mut source: Box<dyn CaptureSource>, settings: CaptureSettings) -> Self {
        let device = source.device().to_string();
        if let Err(err) = source.open() {
            log::error!("could not open camera {}: {:#}", device, err);
            return Self::closed(&device, settings);
        }
        if !source.is_open() {
            log::error!("could not open camera {}", device);
            return Self::closed(&device, settings);
        }
        log::info!("camera {} successfully opened", device);
        if let Err(err) = source.configure(&settings) {
            log::warn!(
                "camera {}: could not apply {}x{}@{}fps: {:#}",
                device,
                settings.width,
                settings.height,
                settings.fps,
                err
            );
        }
        Self {
            source: Some(source),
            device,
            settings,
            frames_read: 0,
        }
    }

    fn closed(device: &str, settings: CaptureSettings) -> Self {
        Self {
            source: None,
            device: device.to_string(),
            settings,
            frames_read: 0,
        }
    }

    pub fn shared(self) -> SharedCamera {
        Arc::new(Mutex::new(self))
    }

    pub fn is_open(&self) -> bool {
        self.source.as_ref().is_some_and(|source| source.is_open())
    }

    /// Read the next frame from the device.
    pub fn read(&mut self) -> Result<Frame> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| anyhow!("camera {} is not open", self.device))?;
        let frame = source
            .read()
            .with_context(|| format!("read frame from {}", self.device))?;
        self.frames_read += 1;
        Ok(frame)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings
    }

    /// Frames successfully read since startup, across all connections.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

/// Lock the shared camera and read one frame.
pub fn read_shared(camera: &SharedCamera) -> Result<Frame> {
    let mut camera = camera
        .lock()
        .map_err(|_| anyhow!("camera lock poisoned"))?;
    camera.read()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefusingSource;

    impl CaptureSource for RefusingSource {
        fn open(&mut self) -> Result<()> {
            Err(anyhow!("device busy"))
        }

        fn configure(&mut self, _settings: &CaptureSettings) -> Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            false
        }

        fn read(&mut self) -> Result<Frame> {
            Err(anyhow!("not open"))
        }

        fn device(&self) -> &str {
            "refusing"
        }
    }

    #[test]
    fn stub_camera_opens_and_reads() -> Result<()> {
        let mut camera = Camera::connect("stub://test", CaptureSettings::default());
        assert!(camera.is_open());

        let frame = camera.read()?;
        assert_eq!(frame.width, DEFAULT_WIDTH);
        assert_eq!(frame.height, DEFAULT_HEIGHT);
        assert_eq!(camera.frames_read(), 1);
        Ok(())
    }

    #[test]
    fn open_failure_leaves_camera_closed() {
        let mut camera = Camera::with_source(Box::new(RefusingSource), CaptureSettings::default());
        assert!(!camera.is_open());
        assert_eq!(camera.device(), "refusing");

        let err = camera.read().unwrap_err();
        assert!(err.to_string().contains("not open"));
        assert_eq!(camera.frames_read(), 0);
    }

    #[test]
    fn bare_index_maps_to_device_node() {
        assert_eq!(device_path("0"), "/dev/video0");
        assert_eq!(device_path(" 2 "), "/dev/video2");
        assert_eq!(device_path("/dev/video7"), "/dev/video7");
    }

    #[test]
    fn shared_read_goes_through_the_session() -> Result<()> {
        let camera = Camera::connect("stub://shared", CaptureSettings::default()).shared();
        read_shared(&camera)?;
        read_shared(&camera)?;
        let guard = camera.lock().map_err(|_| anyhow!("poisoned"))?;
        assert_eq!(guard.frames_read(), 2);
        Ok(())
    }
}
