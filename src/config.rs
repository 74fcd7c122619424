use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{CaptureSettings, DEFAULT_FPS, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::producer::{StreamSettings, DEFAULT_FRAME_INTERVAL, DEFAULT_READ_RETRY_DELAY};
use crate::server::{ServerConfig, DEFAULT_ADDR};

const DEFAULT_DEVICE: &str = "/dev/video0";

pub const CONFIG_ENV: &str = "PLANT_MONITOR_CONFIG";
pub const ADDR_ENV: &str = "PLANT_MONITOR_ADDR";
pub const DEVICE_ENV: &str = "PLANT_MONITOR_DEVICE";
pub const JPEG_QUALITY_ENV: &str = "PLANT_MONITOR_JPEG_QUALITY";

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    addr: Option<String>,
    device: Option<String>,
    index_html: Option<PathBuf>,
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
    frame_interval_ms: Option<u64>,
    read_retry_ms: Option<u64>,
}

/// Everything the `plant_monitor` binary needs to start.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub addr: String,
    pub device: String,
    pub index_html: Option<PathBuf>,
    pub capture: CaptureSettings,
    pub jpeg_quality: u8,
    pub stream: StreamSettings,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            device: DEFAULT_DEVICE.to_string(),
            index_html: None,
            capture: CaptureSettings::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            stream: StreamSettings::default(),
        }
    }
}

impl MonitorConfig {
    /// Load from the file named by `PLANT_MONITOR_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        Self {
            addr: file.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            device: file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            index_html: file.index_html,
            capture: CaptureSettings {
                width: camera.width.unwrap_or(DEFAULT_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_FPS),
            },
            jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            stream: StreamSettings {
                frame_interval: stream
                    .frame_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_FRAME_INTERVAL),
                read_retry_delay: stream
                    .read_retry_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_READ_RETRY_DELAY),
                ..StreamSettings::default()
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var(ADDR_ENV) {
            if !addr.trim().is_empty() {
                self.addr = addr.trim().to_string();
            }
        }
        if let Ok(device) = std::env::var(DEVICE_ENV) {
            if !device.trim().is_empty() {
                self.device = device.trim().to_string();
            }
        }
        if let Ok(quality) = std::env::var(JPEG_QUALITY_ENV) {
            if !quality.trim().is_empty() {
                self.jpeg_quality = quality.trim().parse().map_err(|_| {
                    anyhow!("{} must be an integer between 1 and 100", JPEG_QUALITY_ENV)
                })?;
            }
        }
        Ok(())
    }

    /// Check ranges. Called by `load`; call again after applying CLI overrides.
    pub fn validate(&self) -> Result<()> {
        self.addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.addr, e))?;
        if self.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!(
                "camera dimensions must be non-zero (got {}x{})",
                self.capture.width,
                self.capture.height
            ));
        }
        if self.capture.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be between 1 and 100 (got {})",
                self.jpeg_quality
            ));
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.addr.clone(),
            stream: self.stream,
            jpeg_quality: self.jpeg_quality,
            index_html: self.index_html.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: MonitorConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
