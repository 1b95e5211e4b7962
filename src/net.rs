//! Low-level socket plumbing shared by the poller and the transport.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::io::ScopedSocket;

/// A connected `AF_UNIX` stream pair, both ends close-on-exec.
pub fn socketpair() -> io::Result<(ScopedSocket, ScopedSocket)> {
    let mut fds = [0 as libc::c_int; 2];
    let r = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM,
            0,
            fds.as_mut_ptr(),
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    let a = unsafe { ScopedSocket::from_raw(fds[0]) };
    let b = unsafe { ScopedSocket::from_raw(fds[1]) };
    a.set_close_on_exec()?;
    b.set_close_on_exec()?;
    Ok((a, b))
}

/// The signaling pair backing a worker's poll breaker: `(read end,
/// write end)`, both nonblocking and close-on-exec. A single byte written
/// to the write end wakes the poller regardless of how many submissions
/// occurred.
pub fn breaker_pair() -> io::Result<(ScopedSocket, ScopedSocket)> {
    let (r, w) = socketpair()?;
    r.set_nonblocking()?;
    w.set_nonblocking()?;
    Ok((r, w))
}

/// Resolves `host:port` and connects with a timeout, returning a
/// nonblocking close-on-exec socket.
pub fn connect_with_timeout(
    host: &str,
    port: u16,
    timeout: Duration,
) -> io::Result<ScopedSocket> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let mut last_err =
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                let sock = ScopedSocket::from(stream);
                sock.set_nonblocking()?;
                sock.set_close_on_exec()?;
                return Ok(sock);
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}
