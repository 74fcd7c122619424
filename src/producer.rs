//! MJPEG frame producer.
//!
//! `FrameProducer` is the pull side of a `/video_feed` response: every call to
//! `next()` blocks until one multipart chunk is ready. The sequence only ends when
//! the server shuts down or the client liveness check reports the peer gone; both
//! are checked on every loop turn, so a stalled camera cannot pin a dead connection.
//!
//! Per read:
//! - read failure: logged, retried after `read_retry_delay`, forever
//! - every `milestone_every`-th frame: logged as a throughput milestone and not sent
//! - encode failure: logged, frame skipped, no backoff
//! - otherwise one chunk, followed by `frame_interval` of pacing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{read_shared, SharedCamera};
use crate::encode::FrameEncoder;

/// `Content-Type` of a `/video_feed` response.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);
pub const DEFAULT_READ_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MILESTONE_EVERY: u64 = 30;

/// Timing of a producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    /// Pause after each emitted chunk (~30 fps).
    pub frame_interval: Duration,
    /// Pause before retrying a failed read.
    pub read_retry_delay: Duration,
    /// Frames counted between throughput log lines.
    pub milestone_every: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            read_retry_delay: DEFAULT_READ_RETRY_DELAY,
            milestone_every: DEFAULT_MILESTONE_EVERY,
        }
    }
}

/// Wrap one encoded image in the multipart framing.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut chunk = Vec::with_capacity(HEAD.len() + jpeg.len() + 2);
    chunk.extend_from_slice(HEAD);
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

/// Returns `false` once the consumer is gone.
pub type LivenessCheck = Box<dyn FnMut() -> bool + Send>;

pub struct FrameProducer<E: FrameEncoder> {
    camera: SharedCamera,
    encoder: E,
    settings: StreamSettings,
    frame_count: u64,
    pace_pending: bool,
    shutdown: Option<Arc<AtomicBool>>,
    liveness: Option<LivenessCheck>,
}

impl<E: FrameEncoder> FrameProducer<E> {
    pub fn new(camera: SharedCamera, encoder: E, settings: StreamSettings) -> Self {
        Self {
            camera,
            encoder,
            settings,
            frame_count: 0,
            pace_pending: false,
            shutdown: None,
            liveness: None,
        }
    }

    /// End the sequence once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// End the sequence once `check` returns `false`.
    pub fn with_liveness(mut self, check: impl FnMut() -> bool + Send + 'static) -> Self {
        self.liveness = Some(Box::new(check));
        self
    }

    /// Frames successfully read by this producer.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn should_stop(&mut self) -> bool {
        if self
            .shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return true;
        }
        self.liveness.as_mut().is_some_and(|alive| !alive())
    }

    fn is_milestone(&self) -> bool {
        self.settings.milestone_every > 0 && self.frame_count % self.settings.milestone_every == 0
    }
}

impl<E: FrameEncoder> Iterator for FrameProducer<E> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.pace_pending {
            self.pace_pending = false;
            sleep(self.settings.frame_interval);
        }
        loop {
            if self.should_stop() {
                return None;
            }

            let frame = match read_shared(&self.camera) {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("failed to read frame {}: {:#}", self.frame_count, err);
                    sleep(self.settings.read_retry_delay);
                    continue;
                }
            };

            self.frame_count += 1;
            if self.is_milestone() {
                log::info!("successfully streamed {} frames", self.frame_count);
                continue;
            }

            let jpeg = match self.encoder.encode(&frame) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    log::error!("failed to encode frame {}: {:#}", self.frame_count, err);
                    continue;
                }
            };

            self.pace_pending = true;
            return Some(multipart_chunk(&jpeg));
        }
    }
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
