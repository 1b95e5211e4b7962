//! HTTP/1.1 RPC client.
//!
//! [`HttpClient`] owns the socket factory, the optional TLS engine
//! factory, and keep-alive options. Each logical call runs as an
//! [`rpc::HttpCall`] state machine driven by descriptor events; there is
//! no blocking I/O anywhere below [`HttpClient::call_bytes`], which waits
//! on the finished flag.

pub mod multi;
pub mod rpc;

pub use rpc::{Status, StatusRef};

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

use crate::error::ErrorCode;
use crate::socket_factory::SocketFactory;
use crate::task::Task;
use crate::tls::{TlsEngineFactory, TlsOptions};
use crate::worker::WorkerPool;

/// Product tag sent as `User-Agent`.
pub const USER_AGENT: &str = concat!("remcc/", env!("CARGO_PKG_VERSION"));

pub const HEALTH_OK: &str = "ok";
pub const HEALTH_REJECTED: &str =
    "running: access to backend servers was rejected.";
pub const HEALTH_CONNECT_FAILED: &str =
    "error: failed to connect to backend servers";
pub const HEALTH_SEND_FAILED: &str =
    "running: failed to send request to backend servers";

#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub dest_host_name: String,
    pub dest_port: u16,
    pub use_ssl: bool,
    pub proxy_host_name: String,
    pub proxy_port: u16,
    pub url_path_prefix: String,
    pub content_type_for_protobuf: String,
    pub start_compression: bool,
    pub num_retry_max: usize,
    pub min_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub socket_read_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> HttpClientOptions {
        HttpClientOptions {
            dest_host_name: String::new(),
            dest_port: 0,
            use_ssl: false,
            proxy_host_name: String::new(),
            proxy_port: 0,
            url_path_prefix: String::new(),
            content_type_for_protobuf: "binary/x-protocol-buffer".to_string(),
            start_compression: false,
            num_retry_max: 5,
            min_retry_backoff: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(5),
            socket_read_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpClientOptions {
    pub fn use_proxy(&self) -> bool {
        !self.proxy_host_name.is_empty()
    }

    /// Where the TCP connection actually goes.
    pub fn socket_host(&self) -> String {
        if self.use_proxy() {
            self.proxy_host_name.clone()
        } else {
            self.dest_host_name.clone()
        }
    }

    pub fn socket_port(&self) -> u16 {
        if self.use_proxy() {
            self.proxy_port
        } else {
            self.dest_port
        }
    }

    /// The request target. Through a plaintext proxy the absolute URI is
    /// used; otherwise the origin-form path.
    pub fn request_target(&self, path: &str) -> String {
        let full = format!("{}{}", self.url_path_prefix, path);
        if self.use_proxy() && !self.use_ssl {
            format!("http://{}:{}{}", self.dest_host_name, self.dest_port, full)
        } else {
            full
        }
    }

    pub(crate) fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            use_proxy: self.use_proxy(),
            dest_host_name: self.dest_host_name.clone(),
            dest_port: self.dest_port,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

#[derive(Default)]
struct ClientStats {
    health_status: String,
    shutting_down: bool,
    num_query: usize,
    num_active: usize,
    num_http_retry: usize,
    num_http_timeout: usize,
    num_http_error: usize,
}

pub struct HttpClient {
    options: HttpClientOptions,
    socket_factory: Box<dyn SocketFactory>,
    tls_factory: Option<Box<dyn TlsEngineFactory>>,
    wm: Arc<WorkerPool>,
    stats: Mutex<ClientStats>,
}

impl HttpClient {
    pub fn new(
        options: HttpClientOptions,
        socket_factory: Box<dyn SocketFactory>,
        tls_factory: Option<Box<dyn TlsEngineFactory>>,
        wm: Arc<WorkerPool>,
    ) -> Arc<HttpClient> {
        debug_assert!(!options.use_ssl || tls_factory.is_some());
        Arc::new(HttpClient {
            options,
            socket_factory,
            tls_factory,
            wm,
            stats: Mutex::new(ClientStats {
                health_status: "initializing".to_string(),
                ..Default::default()
            }),
        })
    }

    pub fn options(&self) -> &HttpClientOptions {
        &self.options
    }

    pub(crate) fn socket_factory(&self) -> &dyn SocketFactory {
        self.socket_factory.as_ref()
    }

    pub(crate) fn tls_factory(&self) -> Option<&dyn TlsEngineFactory> {
        self.tls_factory.as_deref()
    }

    pub(crate) fn wm(&self) -> &Arc<WorkerPool> {
        &self.wm
    }

    pub fn health_status(&self) -> String {
        self.stats.lock().unwrap().health_status.clone()
    }

    pub fn set_health_status(&self, status: &str) {
        let mut stats = self.stats.lock().unwrap();
        if stats.health_status != status {
            info!("health status: {:?} -> {:?}", stats.health_status, status);
            stats.health_status = status.to_string();
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.stats.lock().unwrap().shutting_down
    }

    /// New calls fail fast after this; in-flight calls drain.
    pub fn shutdown(&self) {
        self.stats.lock().unwrap().shutting_down = true;
    }

    pub(crate) fn record_query_start(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.num_query += 1;
        stats.num_active += 1;
    }

    pub(crate) fn record_query_finish(&self, err: ErrorCode, retried: bool) {
        let mut stats = self.stats.lock().unwrap();
        stats.num_active = stats.num_active.saturating_sub(1);
        if retried {
            stats.num_http_retry += 1;
        }
        match err {
            ErrorCode::Ok => {}
            ErrorCode::Timeout => stats.num_http_timeout += 1,
            ErrorCode::Fail => stats.num_http_error += 1,
        }
    }

    /// Starts an asynchronous call. `callback` (if any) runs exactly once
    /// on the submitter's worker thread after `status` is finished.
    pub fn call_with_callback(
        self: &Arc<Self>,
        path: &str,
        req: Vec<u8>,
        status: StatusRef,
        callback: Option<Task>,
    ) {
        rpc::HttpCall::start(self, path, req, status, callback);
    }

    /// Synchronous call; must not be invoked from a pool worker (it blocks
    /// on the finished flag).
    pub fn call_bytes(self: &Arc<Self>, path: &str, req: Vec<u8>, status: &StatusRef) {
        self.call_with_callback(path, req, status.clone(), None);
        status.wait_finished();
    }

    /// Health probe: an empty POST to `path`. Updates the cached health
    /// status string and returns the HTTP status code (negative on connect
    /// failure).
    pub fn ping(self: &Arc<Self>, path: &str) -> i32 {
        let status = StatusRef::new();
        self.call_bytes(path, Vec::new(), &status);
        let snap = status.snapshot();
        if !snap.connect_success {
            self.set_health_status(HEALTH_CONNECT_FAILED);
            return -1;
        }
        let code = snap.http_return_code;
        self.set_health_status(match code {
            200..=299 => HEALTH_OK,
            400..=499 => HEALTH_REJECTED,
            _ => HEALTH_SEND_FAILED,
        });
        code
    }

    pub fn debug_string(&self) -> String {
        let stats = self.stats.lock().unwrap();
        format!(
            "dest={} health={} query={} active={} retry={} timeout={} error={}",
            self.socket_factory.dest_name(),
            stats.health_status,
            stats.num_query,
            stats.num_active,
            stats.num_http_retry,
            stats.num_http_timeout,
            stats.num_http_error
        )
    }
}

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub code: i32,
    pub head_len: usize,
    pub raw: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses a response head once `\r\n\r\n` has arrived; `None` until then.
pub(crate) fn parse_response_head(buf: &[u8]) -> Option<ResponseHead> {
    let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let raw = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = raw.split("\r\n");
    let status_line = lines.next()?;
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?.parse().ok()?;
    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    Some(ResponseHead {
        code,
        head_len: head_end + 4,
        raw,
        headers,
    })
}

pub(crate) fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    // Writing into a Vec cannot fail.
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub(crate) fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_head_parses_headers_case_insensitively() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Type: text/plain\r\n\r\nok",
        )
        .unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.header("content-length"), Some("2"));
        assert_eq!(head.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(head.head_len, 64);
    }

    #[test]
    fn incomplete_head_is_none() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Le").is_none());
    }

    #[test]
    fn gzip_round_trip() {
        let data = b"some compile request payload".repeat(64);
        let packed = gzip_compress(&data);
        assert!(packed.len() < data.len());
        assert_eq!(gzip_decompress(&packed).unwrap(), data);
    }

    #[test]
    fn request_target_through_plain_proxy_is_absolute() {
        let options = HttpClientOptions {
            dest_host_name: "backend".to_string(),
            dest_port: 8080,
            proxy_host_name: "proxy".to_string(),
            proxy_port: 3128,
            ..Default::default()
        };
        assert_eq!(options.request_target("/e"), "http://backend:8080/e");
        assert_eq!(options.socket_host(), "proxy");
        assert_eq!(options.socket_port(), 3128);
    }
}
