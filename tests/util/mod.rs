#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Once;
use std::thread::JoinHandle;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// One request the mock server observed: raw head plus body bytes.
pub struct SeenRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn path(&self) -> String {
        self.head
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .unwrap_or("")
            .to_string()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            if k.trim().eq_ignore_ascii_case(name) {
                Some(v.trim().to_string())
            } else {
                None
            }
        })
    }
}

pub enum MockReply {
    /// Write these bytes, keep the connection open.
    Respond(Vec<u8>),
    /// Write these bytes, then close.
    RespondAndClose(Vec<u8>),
    /// Close without writing anything.
    Close,
}

/// A sequential mock HTTP server: accepts connections one at a time and
/// reports each request it saw.
pub struct MockHttpServer {
    pub port: u16,
    handle: Option<JoinHandle<()>>,
    seen: Receiver<SeenRequest>,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl MockHttpServer {
    pub fn start<F>(mut responder: F) -> MockHttpServer
    where
        F: FnMut(&SeenRequest) -> MockReply + Send + 'static,
    {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx): (Sender<SeenRequest>, Receiver<SeenRequest>) = channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                if stop2.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(mut stream) = stream else { break };
                loop {
                    let Some(request) = read_request(&mut stream) else {
                        break;
                    };
                    let reply = responder(&request);
                    if tx.send(request).is_err() {
                        return;
                    }
                    match reply {
                        MockReply::Respond(bytes) => {
                            if stream.write_all(&bytes).is_err() {
                                break;
                            }
                        }
                        MockReply::RespondAndClose(bytes) => {
                            let _ = stream.write_all(&bytes);
                            break;
                        }
                        MockReply::Close => break,
                    }
                }
            }
        });
        MockHttpServer {
            port,
            handle: Some(handle),
            seen: rx,
            stop,
        }
    }

    pub fn next_request(&self) -> SeenRequest {
        self.seen
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("mock server saw no request")
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        // Connecting unblocks the accept loop so the thread can observe
        // the stop flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end - 4]).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| v.trim().parse().ok())?
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Some(SeenRequest { head, body })
}

/// Formats a plain 200 response with a `Content-Length` body.
pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn status_response(code: u16, reason: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
        code,
        reason,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}
