//! Plant Monitor
//!
//! Streams a single camera to any number of browsers as an MJPEG
//! (`multipart/x-mixed-replace`) feed.
//!
//! # Module Structure
//!
//! - `frame`: raw RGB frame container
//! - `capture`: camera backends and the process-wide `Camera` session
//! - `encode`: JPEG encoding
//! - `producer`: the per-connection frame loop that yields multipart chunks
//! - `server`: blocking HTTP server (`/`, `/video_feed`, `/snapshot`, `/health`)
//! - `config`: file + environment configuration for the binary

pub mod capture;
pub mod config;
pub mod encode;
pub mod frame;
pub mod producer;
pub mod server;

pub use capture::{Camera, CaptureSettings, CaptureSource, SharedCamera};
pub use config::MonitorConfig;
pub use encode::{FrameEncoder, JpegEncoder};
pub use frame::Frame;
pub use producer::{multipart_chunk, FrameProducer, StreamSettings, STREAM_CONTENT_TYPE};
pub use server::{ServerConfig, ServerHandle, StreamServer};
