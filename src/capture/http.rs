//! Upstream HTTP camera source.
//!
//! `HttpCameraSource` pulls frames from a network camera over HTTP, e.g. an
//! ESP32-S3 board. Two upstream shapes are understood:
//! - a `multipart/*` MJPEG stream, read continuously
//! - a single-JPEG snapshot endpoint, fetched once per frame
//!
//! JPEG payloads are decoded in memory to RGB8 so they go through the same
//! encode path as local devices.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use url::Url;

use super::{CaptureSettings, CaptureSource};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpCameraSource {
    url: String,
    target_fps: u32,
    stream: Option<UpstreamStream>,
    last_frame_at: Option<Instant>,
}

enum UpstreamStream {
    Mjpeg(MjpegReader),
    Snapshot,
}

impl HttpCameraSource {
    pub fn new(url: &str, target_fps: u32) -> Result<Self> {
        let parsed = Url::parse(url).context("parse camera url")?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported camera scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self {
            url: url.to_string(),
            target_fps,
            stream: None,
            last_frame_at: None,
        })
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http camera not connected; call open() first"))?;
        match stream {
            UpstreamStream::Mjpeg(reader) => reader.read_next_jpeg(),
            UpstreamStream::Snapshot => fetch_snapshot(&self.url),
        }
    }
}

impl CaptureSource for HttpCameraSource {
    fn open(&mut self) -> Result<()> {
        let response = ureq::get(&self.url)
            .call()
            .with_context(|| format!("connect to http camera {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(UpstreamStream::Mjpeg(MjpegReader::new(
                response.into_reader(),
            )));
        } else {
            self.stream = Some(UpstreamStream::Snapshot);
        }
        Ok(())
    }

    fn configure(&mut self, settings: &CaptureSettings) -> Result<()> {
        // Geometry is decided by the upstream board; only the rate is ours.
        self.target_fps = settings.fps;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self) -> Result<Frame> {
        let min_interval = frame_interval(self.target_fps);
        loop {
            if matches!(self.stream, Some(UpstreamStream::Snapshot)) {
                // Snapshots are fetched on demand: wait instead of fetching early.
                let wait = remaining_interval(self.last_frame_at, Instant::now(), min_interval);
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
            }
            let jpeg = self.next_jpeg()?;
            let now = Instant::now();
            // A pushed stream can run ahead of the target rate; drop the extras.
            if !remaining_interval(self.last_frame_at, now, min_interval).is_zero() {
                continue;
            }
            self.last_frame_at = Some(now);
            return decode_jpeg(&jpeg);
        }
    }

    fn device(&self) -> &str {
        &self.url
    }
}

struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // Keep the tail in case an SOI marker straddles the cut.
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    Frame::new(rgb.into_raw(), width, height)
}

/// Locate the first complete JPEG (SOI .. EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

/// Time left before the next frame is due.
fn remaining_interval(last: Option<Instant>, now: Instant, min_interval: Duration) -> Duration {
    last.map_or(Duration::ZERO, |last| {
        min_interval.saturating_sub(now.saturating_duration_since(last))
    })
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_jpeg_between_multipart_headers() {
        let mut data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        data.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        data.extend_from_slice(b"\r\n--frame");

        let (start, end) = find_jpeg_bounds(&data).expect("bounds");
        assert_eq!(&data[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_has_no_bounds() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2]).is_none());
        assert!(find_jpeg_bounds(b"no markers").is_none());
    }

    #[test]
    fn mjpeg_reader_yields_consecutive_frames() -> Result<()> {
        let mut body = Vec::new();
        for marker in [0xA1u8, 0xA2] {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&[0xFF, 0xD8, marker, 0xFF, 0xD9]);
            body.extend_from_slice(b"\r\n");
        }
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));

        assert_eq!(reader.read_next_jpeg()?, vec![0xFF, 0xD8, 0xA1, 0xFF, 0xD9]);
        assert_eq!(reader.read_next_jpeg()?, vec![0xFF, 0xD8, 0xA2, 0xFF, 0xD9]);
        assert!(reader.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn remaining_interval_counts_down_from_last_frame() {
        let last = Instant::now();
        let min = Duration::from_millis(100);

        assert_eq!(remaining_interval(None, last, min), Duration::ZERO);
        assert_eq!(
            remaining_interval(Some(last), last + Duration::from_millis(40), min),
            Duration::from_millis(60)
        );
        assert_eq!(
            remaining_interval(Some(last), last + Duration::from_millis(150), min),
            Duration::ZERO
        );
    }

    #[test]
    fn snapshot_reads_wait_out_the_frame_interval() -> Result<()> {
        let mut source = HttpCameraSource::new("http://127.0.0.1:9/capture", 10)?;
        source.stream = Some(UpstreamStream::Snapshot);
        source.last_frame_at = Some(Instant::now());

        // Nothing listens on the discard port: the fetch fails, but only after
        // the remaining ~100ms of the interval has been slept.
        let started = Instant::now();
        assert!(source.read().is_err());
        assert!(started.elapsed() >= Duration::from_millis(80));
        Ok(())
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpCameraSource::new("rtsp://camera/stream", 10).is_err());
        assert!(HttpCameraSource::new("http://192.168.1.50/stream", 10).is_ok());
    }
}
