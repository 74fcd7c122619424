//! plant_monitor - camera MJPEG streaming server
//!
//! This daemon:
//! 1. Opens the configured camera once (failure is logged, not fatal)
//! 2. Serves the index page and the `/video_feed` MJPEG stream
//! 3. Runs until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use plant_monitor::{
    capture::Camera,
    config::MonitorConfig,
    server::StreamServer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream a local camera to browsers as MJPEG")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "PLANT_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:5000.
    #[arg(long)]
    addr: Option<String>,

    /// Camera device: /dev/videoN, a bare index, http(s)://camera/stream, or stub://name.
    #[arg(long)]
    device: Option<String>,

    /// JPEG quality (1-100).
    #[arg(long)]
    jpeg_quality: Option<u8>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = MonitorConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(quality) = args.jpeg_quality {
        config.jpeg_quality = quality;
    }
    config.validate()?;

    let camera = Camera::connect(&config.device, config.capture).shared();

    log::info!("Starting Plant Monitor server...");
    let handle = StreamServer::new(config.server_config(), camera).spawn()?;
    log::info!("listening on {}", handle.addr);
    log::info!(
        "Open your browser and go to: http://localhost:{}",
        handle.addr.port()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping server...");
    handle.stop()?;

    Ok(())
}
