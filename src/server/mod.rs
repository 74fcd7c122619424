//! HTTP front end.
//!
//! A small blocking HTTP/1.1 server on `std::net`. The accept loop polls a
//! non-blocking listener and hands each connection to its own thread, since a
//! `/video_feed` response lasts as long as the client stays connected.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::{read_shared, SharedCamera};
use crate::encode::{FrameEncoder, JpegEncoder, DEFAULT_JPEG_QUALITY};
use crate::producer::{FrameProducer, StreamSettings, STREAM_CONTENT_TYPE};

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CLIENT_PROBE_TIMEOUT: Duration = Duration::from_millis(1);
const DEFAULT_INDEX_HTML: &str = include_str!("index.html");

pub const DEFAULT_ADDR: &str = "0.0.0.0:5000";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub stream: StreamSettings,
    pub jpeg_quality: u8,
    /// HTML file served at `/` instead of the built-in page.
    pub index_html: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            stream: StreamSettings::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            index_html: None,
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting connections. Open streams end at their producer's next loop turn.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

struct ServerContext {
    camera: SharedCamera,
    encoder: JpegEncoder,
    stream: StreamSettings,
    index_html: Vec<u8>,
    active_streams: AtomicUsize,
}

/// Counts one open `/video_feed` response for as long as it lives.
struct ActiveStream<'a>(&'a AtomicUsize);

impl<'a> ActiveStream<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveStream<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

type ConnectionTask = Box<dyn FnOnce() + Send>;

pub struct StreamServer {
    cfg: ServerConfig,
    camera: SharedCamera,
}

impl StreamServer {
    pub fn new(cfg: ServerConfig, camera: SharedCamera) -> Self {
        Self { cfg, camera }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let index_html = match &self.cfg.index_html {
            Some(path) => std::fs::read(path)
                .with_context(|| format!("read index page {}", path.display()))?,
            None => DEFAULT_INDEX_HTML.as_bytes().to_vec(),
        };

        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let ctx = Arc::new(ServerContext {
            camera: self.camera,
            encoder: JpegEncoder::new(self.cfg.jpeg_quality),
            stream: self.cfg.stream,
            index_html,
            active_streams: AtomicUsize::new(0),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                run_server(listener, ctx, shutdown_thread, spawn_connection_thread);
            })?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn spawn_connection_thread(task: ConnectionTask) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("http-conn".to_string())
        .spawn(task)
        .map(|_| ())
}

/// Accept until `shutdown` is set. Failures to accept or to start a connection
/// thread only cost that connection; the loop keeps running.
fn run_server<S>(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: Arc<AtomicBool>,
    spawn: S,
) where
    S: Fn(ConnectionTask) -> std::io::Result<()>,
{
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                let task: ConnectionTask = Box::new(move || {
                    if let Err(err) = handle_connection(stream, &ctx, &shutdown) {
                        log::warn!("request from {} rejected: {:#}", peer, err);
                    }
                });
                if let Err(err) = spawn(task) {
                    log::warn!("dropping connection from {}: cannot start thread: {}", peer, err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(err) => {
                log::warn!("accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    log::debug!("http accept loop stopped");
}

fn handle_connection(
    mut stream: TcpStream,
    ctx: &ServerContext,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::debug!(
        "{} {} ({})",
        request.method,
        request.path,
        request.user_agent().unwrap_or("unknown agent")
    );

    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/" => write_response(&mut stream, 200, "text/html; charset=utf-8", &ctx.index_html),
        "/video_feed" => serve_video_feed(stream, ctx, shutdown),
        "/snapshot" => serve_snapshot(&mut stream, ctx),
        "/health" => serve_health(&mut stream, ctx),
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn serve_video_feed(
    mut stream: TcpStream,
    ctx: &ServerContext,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let client_alive = client_liveness(&stream)?;
    let _active = ActiveStream::enter(&ctx.active_streams);
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {STREAM_CONTENT_TYPE}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    log::info!("video feed opened for {}", peer);

    let producer = FrameProducer::new(ctx.camera.clone(), ctx.encoder, ctx.stream)
        .with_shutdown(shutdown.clone())
        .with_liveness(client_alive);
    for chunk in producer {
        if let Err(err) = stream.write_all(&chunk).and_then(|_| stream.flush()) {
            log::debug!("video feed client {} went away: {}", peer, err);
            break;
        }
    }
    log::info!("video feed closed for {}", peer);
    Ok(())
}

/// Peek at the socket without consuming anything: EOF or a socket error means
/// the client hung up. The stream body never reads, so the short timeout on the
/// shared socket is safe.
fn client_liveness(stream: &TcpStream) -> Result<impl FnMut() -> bool + Send + 'static> {
    let probe = stream.try_clone().context("clone client socket")?;
    probe.set_read_timeout(Some(CLIENT_PROBE_TIMEOUT))?;
    let mut buf = [0u8; 1];
    Ok(move || match probe.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) => matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
        ),
    })
}

fn serve_snapshot(stream: &mut TcpStream, ctx: &ServerContext) -> Result<()> {
    let mut encoder = ctx.encoder;
    let jpeg = read_shared(&ctx.camera).and_then(|frame| encoder.encode(&frame));
    match jpeg {
        Ok(jpeg) => write_response(stream, 200, "image/jpeg", &jpeg),
        Err(err) => {
            log::warn!("snapshot failed: {:#}", err);
            write_json_response(stream, 503, r#"{"error":"capture_failed"}"#)
        }
    }
}

fn serve_health(stream: &mut TcpStream, ctx: &ServerContext) -> Result<()> {
    let body = {
        let camera = ctx
            .camera
            .lock()
            .map_err(|_| anyhow!("camera lock poisoned"))?;
        let capture = camera.settings();
        serde_json::json!({
            "status": "ok",
            "camera_open": camera.is_open(),
            "device": camera.device(),
            "capture": {
                "width": capture.width,
                "height": capture.height,
                "fps": capture.fps,
            },
            "frames_read": camera.frames_read(),
            "active_streams": ctx.active_streams.load(Ordering::SeqCst),
        })
    };
    let payload = serde_json::to_vec(&body)?;
    write_response(stream, 200, "application/json", &payload)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).context("read request head")?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request head exceeds {} bytes", MAX_REQUEST_BYTES));
        }
    }
    HttpRequest::parse(&data)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    /// Path without the query string; routing ignores queries.
    path: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn parse(head: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| anyhow!("empty request"))?;
        let (method, target) = match request_line.split_whitespace().collect::<Vec<_>>()[..] {
            [method, target, ..] => (method, target),
            _ => return Err(anyhow!("malformed request line '{}'", request_line)),
        };
        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        let path = target.split_once('?').map_or(target, |(path, _)| path);
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        })
    }

    fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Camera, CaptureSettings};

    #[test]
    fn parses_request_line_headers_and_strips_query() -> Result<()> {
        let request =
            HttpRequest::parse(b"GET /health?verbose=1 HTTP/1.1\r\nUser-Agent: curl/8.0\r\n\r\n")?;
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/health");
        assert_eq!(request.user_agent(), Some("curl/8.0"));
        Ok(())
    }

    #[test]
    fn rejects_empty_or_truncated_request_line() {
        assert!(HttpRequest::parse(b"").is_err());
        assert!(HttpRequest::parse(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn failed_thread_spawn_drops_only_that_connection() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let ctx = Arc::new(ServerContext {
            camera: Camera::connect("stub://spawn", CaptureSettings::default()).shared(),
            encoder: JpegEncoder::default(),
            stream: StreamSettings::default(),
            index_html: b"ok".to_vec(),
            active_streams: AtomicUsize::new(0),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));

        let accept = {
            let shutdown = shutdown.clone();
            let attempts = attempts.clone();
            std::thread::spawn(move || {
                run_server(listener, ctx, shutdown, move |task| {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(std::io::Error::new(ErrorKind::Other, "thread limit"));
                    }
                    spawn_connection_thread(task)
                })
            })
        };

        let mut refused = TcpStream::connect(addr)?;
        refused.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut leftover = Vec::new();
        // Closed without a response: EOF or a reset, never an HTTP status line.
        let _ = refused.read_to_end(&mut leftover);
        assert!(leftover.is_empty());

        let mut served = TcpStream::connect(addr)?;
        served.set_read_timeout(Some(Duration::from_secs(5)))?;
        served.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        let mut response = Vec::new();
        served.read_to_end(&mut response)?;
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        shutdown.store(true, Ordering::SeqCst);
        accept.join().map_err(|_| anyhow!("accept thread panicked"))?;
        Ok(())
    }
}
