use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use plant_monitor::capture::{Camera, CaptureSettings};
use plant_monitor::producer::StreamSettings;
use plant_monitor::server::{ServerConfig, ServerHandle, StreamServer};

const CHUNK_HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

struct TestServer {
    handle: Option<ServerHandle>,
}

impl TestServer {
    fn new(device: &str) -> Result<Self> {
        let settings = CaptureSettings {
            width: 32,
            height: 24,
            fps: 0,
        };
        let camera = Camera::connect(device, settings).shared();
        let cfg = ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            stream: StreamSettings {
                frame_interval: Duration::from_millis(1),
                read_retry_delay: Duration::from_millis(10),
                ..StreamSettings::default()
            },
            ..ServerConfig::default()
        };
        let handle = StreamServer::new(cfg, camera).spawn()?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = self
            .handle
            .as_ref()
            .expect("test server handle should be initialized")
            .addr;
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(stream)
    }

    fn get(&self, path: &str) -> Result<(String, Vec<u8>)> {
        self.request("GET", path)
    }

    fn request(&self, method: &str, path: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = self.connect()?;
        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = find(&response, b"\r\n\r\n").expect("response has a header block");
        let headers = String::from_utf8_lossy(&response[..split]).to_string();
        Ok((headers, response[split + 4..].to_vec()))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop http server");
        }
    }
}

impl TestServer {
    fn health(&self) -> Result<Value> {
        let (_headers, body) = self.get("/health")?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Send a `/video_feed` request and consume the response head.
fn open_video_feed(stream: &mut TcpStream) -> Result<String> {
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut data = Vec::new();
    let mut buf = [0u8; 1];
    while find(&data, b"\r\n\r\n").is_none() {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "connection closed before headers");
        data.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&data).to_string())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read from `stream` until `needle` has been seen `count` times (or the read times out).
fn read_until(stream: &mut TcpStream, needle: &[u8], count: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let seen = data
            .windows(needle.len())
            .filter(|window| *window == needle)
            .count();
        if seen >= count {
            return Ok(data);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(data);
        }
        data.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn index_is_served_with_stub_camera() -> Result<()> {
    let server = TestServer::new("stub://front")?;
    let (headers, body) = server.get("/")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("text/html"));
    assert!(String::from_utf8_lossy(&body).contains("/video_feed"));
    Ok(())
}

#[test]
fn index_is_served_when_camera_failed_to_open() -> Result<()> {
    let server = TestServer::new("missing://camera")?;
    let (headers, _body) = server.get("/")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn video_feed_streams_multipart_jpeg_chunks() -> Result<()> {
    let server = TestServer::new("stub://front")?;
    let mut stream = server.connect()?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let data = read_until(&mut stream, CHUNK_HEAD, 3)?;
    let split = find(&data, b"\r\n\r\n").expect("header block");
    let headers = String::from_utf8_lossy(&data[..split]);
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert!(headers.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));

    let body = &data[split + 4..];
    assert!(body.starts_with(CHUNK_HEAD));
    let jpeg_start = CHUNK_HEAD.len();
    assert_eq!(&body[jpeg_start..jpeg_start + 2], &[0xFF, 0xD8]);

    // The first chunk ends with EOI + CRLF right before the next boundary.
    let next = jpeg_start + find(&body[jpeg_start..], CHUNK_HEAD).expect("second chunk");
    assert_eq!(&body[next - 4..next], &[0xFF, 0xD9, b'\r', b'\n']);
    Ok(())
}

#[test]
fn video_feed_answers_even_when_camera_failed_to_open() -> Result<()> {
    let server = TestServer::new("missing://camera")?;
    let mut stream = server.connect()?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    while find(&data, b"\r\n\r\n").is_none() {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "connection closed before headers");
        data.extend_from_slice(&buf[..n]);
    }
    let headers = String::from_utf8_lossy(&data);
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));

    // No frame ever arrives; the read times out instead.
    let body_start = find(&data, b"\r\n\r\n").expect("header block") + 4;
    assert_eq!(data.len(), body_start);
    let err = stream.read(&mut buf).expect_err("no frame chunk expected");
    assert!(matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ));
    Ok(())
}

#[test]
fn snapshot_returns_single_jpeg() -> Result<()> {
    let server = TestServer::new("stub://front")?;
    let (headers, body) = server.get("/snapshot")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    Ok(())
}

#[test]
fn snapshot_reports_closed_camera() -> Result<()> {
    let server = TestServer::new("missing://camera")?;
    let (headers, body) = server.get("/snapshot")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert!(String::from_utf8_lossy(&body).contains(r#""error":"capture_failed""#));
    Ok(())
}

#[test]
fn health_reports_camera_state() -> Result<()> {
    let server = TestServer::new("stub://front")?;
    let (headers, body) = server.get("/health?verbose=1")?;
    assert!(headers.contains("200 OK"));

    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["status"], "ok");
    assert_eq!(value["camera_open"], true);
    assert_eq!(value["device"], "stub://front");
    assert_eq!(value["capture"]["width"], 32);
    assert_eq!(value["capture"]["height"], 24);
    assert_eq!(value["active_streams"], 0);
    Ok(())
}

#[test]
fn fixed_responses_carry_length_and_close_headers() -> Result<()> {
    let server = TestServer::new("stub://front")?;
    for path in ["/", "/health", "/snapshot", "/missing"] {
        let (headers, body) = server.get(path)?;
        assert!(
            headers.contains(&format!("Content-Length: {}\r\n", body.len())),
            "{path}: {headers}"
        );
        assert!(headers.contains("Cache-Control: no-store"), "{path}: {headers}");
        assert!(headers.ends_with("Connection: close"), "{path}: {headers}");
    }

    let mut stream = server.connect()?;
    let headers = open_video_feed(&mut stream)?;
    assert!(headers.contains("Connection: close"));
    assert!(!headers.contains("Content-Length"));
    Ok(())
}

#[test]
fn stalled_video_feed_ends_when_client_disconnects() -> Result<()> {
    let server = TestServer::new("missing://camera")?;
    for _ in 0..5 {
        let mut stream = server.connect()?;
        open_video_feed(&mut stream)?;
    }
    let mut stream = server.connect()?;
    open_video_feed(&mut stream)?;
    assert!(server.health()?["active_streams"].as_u64() >= Some(1));

    drop(stream);
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        if server.health()?["active_streams"] == 0 {
            return Ok(());
        }
        assert!(
            std::time::Instant::now() < deadline,
            "stream threads still running after clients left"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn unknown_path_is_not_found() -> Result<()> {
    let server = TestServer::new("stub://front")?;
    let (headers, body) = server.get("/stream")?;
    assert!(headers.contains("404 Not Found"));
    assert!(String::from_utf8_lossy(&body).contains("not_found"));
    Ok(())
}

#[test]
fn non_get_is_rejected() -> Result<()> {
    let server = TestServer::new("stub://front")?;
    let (headers, _body) = server.request("POST", "/video_feed")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}
