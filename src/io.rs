//! Scoped file and socket handles.
//!
//! Thin RAII wrappers over raw descriptors: the handle owns the fd and
//! closes it on drop unless it is released first. Reads and writes map
//! `EAGAIN`/`EWOULDBLOCK` to [`io::ErrorKind::WouldBlock`] and `EINTR` to
//! [`io::ErrorKind::Interrupted`]; callers treat `WouldBlock` as "re-arm
//! and wait for readiness".

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// An owned, optionally-held file descriptor.
pub struct ScopedFd {
    fd: Option<OwnedFd>,
}

impl ScopedFd {
    pub fn new(fd: OwnedFd) -> ScopedFd {
        ScopedFd { fd: Some(fd) }
    }

    /// An empty holder; `valid()` is false.
    pub fn invalid() -> ScopedFd {
        ScopedFd { fd: None }
    }

    /// # Safety
    ///
    /// `fd` must be an open descriptor not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd {
            fd: Some(OwnedFd::from_raw_fd(fd)),
        }
    }

    pub fn valid(&self) -> bool {
        self.fd.is_some()
    }

    pub fn get(&self) -> RawFd {
        match &self.fd {
            Some(fd) => fd.as_raw_fd(),
            None => -1,
        }
    }

    /// Gives up ownership without closing.
    pub fn release(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// Closes now rather than at drop.
    pub fn close(&mut self) {
        self.fd = None;
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.require()?;
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.require()?;
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.require()?;
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_close_on_exec(&self) -> io::Result<()> {
        let fd = self.require()?;
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn require(&self) -> io::Result<RawFd> {
        match &self.fd {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "invalid fd")),
        }
    }
}

impl fmt::Debug for ScopedFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopedFd({})", self.get())
    }
}

impl From<OwnedFd> for ScopedFd {
    fn from(fd: OwnedFd) -> ScopedFd {
        ScopedFd::new(fd)
    }
}

/// An owned socket. Same ownership rules as [`ScopedFd`], plus the
/// operations the transport layer needs.
pub struct ScopedSocket {
    inner: ScopedFd,
}

impl ScopedSocket {
    pub fn new(fd: OwnedFd) -> ScopedSocket {
        ScopedSocket {
            inner: ScopedFd::new(fd),
        }
    }

    pub fn invalid() -> ScopedSocket {
        ScopedSocket {
            inner: ScopedFd::invalid(),
        }
    }

    /// # Safety
    ///
    /// `fd` must be an open socket not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> ScopedSocket {
        ScopedSocket {
            inner: ScopedFd::from_raw(fd),
        }
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn get(&self) -> RawFd {
        self.inner.get()
    }

    pub fn release(&mut self) -> Option<OwnedFd> {
        self.inner.release()
    }

    pub fn close(&mut self) {
        self.inner.close()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        self.inner.set_nonblocking()
    }

    pub fn set_close_on_exec(&self) -> io::Result<()> {
        self.inner.set_close_on_exec()
    }

    /// Half-closes the send direction.
    pub fn shutdown_for_send(&self) -> io::Result<()> {
        let fd = self.get();
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "invalid fd"));
        }
        if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl fmt::Debug for ScopedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopedSocket({})", self.get())
    }
}

impl From<std::net::TcpStream> for ScopedSocket {
    fn from(stream: std::net::TcpStream) -> ScopedSocket {
        unsafe { ScopedSocket::from_raw(stream.into_raw_fd()) }
    }
}

/// Whether `err` means the operation should simply be retried once the
/// descriptor is ready again.
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
