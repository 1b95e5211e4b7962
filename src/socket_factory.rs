//! Socket supply for the HTTP client.
//!
//! The factory hides name resolution, connect timeouts, and keep-alive
//! pooling. `new_socket` hands out either a fresh connection or a pooled
//! one (`reused = true`); clean replies go back through `release_socket`,
//! failed connections through `close_socket`.

use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, trace};

use crate::io::ScopedSocket;
use crate::net::connect_with_timeout;

/// Pooled sockets older than this are discarded instead of reused.
const REUSE_MAX_IDLE: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub trait SocketFactory: Send + Sync {
    /// Returns a connected socket and whether it came from the keep-alive
    /// pool.
    fn new_socket(&self) -> io::Result<(ScopedSocket, bool)>;
    /// Returns a healthy socket to the keep-alive pool.
    fn release_socket(&self, sock: ScopedSocket);
    /// Disposes of a socket; `err` marks connections that died badly.
    fn close_socket(&self, sock: ScopedSocket, err: bool);
    fn host_name(&self) -> String;
    fn port(&self) -> u16;
    fn dest_name(&self) -> String {
        format!("{}:{}", self.host_name(), self.port())
    }
}

pub struct TcpSocketFactory {
    host: String,
    port: u16,
    pool: Mutex<Vec<(ScopedSocket, Instant)>>,
}

impl TcpSocketFactory {
    pub fn new(host: String, port: u16) -> TcpSocketFactory {
        TcpSocketFactory {
            host,
            port,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

impl SocketFactory for TcpSocketFactory {
    fn new_socket(&self) -> io::Result<(ScopedSocket, bool)> {
        {
            let mut pool = self.pool.lock().unwrap();
            while let Some((sock, since)) = pool.pop() {
                if since.elapsed() < REUSE_MAX_IDLE {
                    trace!("reuse socket fd={}", sock.get());
                    return Ok((sock, true));
                }
                info!("pooled socket fd={} expired", sock.get());
            }
        }
        let sock = connect_with_timeout(&self.host, self.port, CONNECT_TIMEOUT)?;
        Ok((sock, false))
    }

    fn release_socket(&self, sock: ScopedSocket) {
        if !sock.valid() {
            return;
        }
        trace!("release socket fd={}", sock.get());
        self.pool.lock().unwrap().push((sock, Instant::now()));
    }

    fn close_socket(&self, mut sock: ScopedSocket, err: bool) {
        if err {
            info!("close socket fd={} after error", sock.get());
        }
        sock.close();
    }

    fn host_name(&self) -> String {
        self.host.clone()
    }

    fn port(&self) -> u16 {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn release_then_new_reuses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let factory = TcpSocketFactory::new("127.0.0.1".to_string(), port);

        let (sock, reused) = factory.new_socket().unwrap();
        assert!(!reused);
        let fd = sock.get();
        factory.release_socket(sock);
        assert_eq!(factory.num_pooled(), 1);

        let (sock, reused) = factory.new_socket().unwrap();
        assert!(reused);
        assert_eq!(sock.get(), fd);
        factory.close_socket(sock, false);
        assert_eq!(factory.num_pooled(), 0);
    }
}
