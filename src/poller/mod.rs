//! Readiness multiplexer behind the worker dispatch loop.
//!
//! One implementation per OS facility: epoll on Linux/Android, kqueue on
//! the BSDs and macOS, and a portable select fallback. All three share the
//! three-phase contract used by the dispatch loop:
//!
//! 1. [`DescriptorPoller::prepare`] — with the worker lock held, scan or
//!    refresh the registered set;
//! 2. [`DescriptorPoller::wait`] — with the lock released, block in the OS
//!    wait for at most the given timeout;
//! 3. [`DescriptorPoller::collect`] — with the lock reacquired, harvest
//!    ready callbacks into the queue, returning whether the poll breaker
//!    broke the wait.
//!
//! The poll breaker is the read end of a signaling socket pair registered
//! for read at construction; it carries no callbacks. Writing one byte to
//! the paired [`Signaler`] wakes the poller no matter how many submissions
//! coalesced behind it.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::descriptor::SocketDescriptor;
use crate::io::{is_retryable, ScopedSocket};
use crate::task::Task;
use crate::worker::Priority;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
mod select;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::epoll::EpollPoller;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use self::kqueue::KqueuePoller;
pub use self::select::SelectPoller;

/// Readiness interest classes a descriptor can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Read,
    Write,
}

/// Descriptors registered on a worker, keyed by raw fd.
pub type DescriptorMap = HashMap<RawFd, Arc<SocketDescriptor>>;

/// Ready callbacks harvested by one `collect`, in discovery order.
pub type CallbackQueue = Vec<(Priority, Task)>;

pub trait DescriptorPoller: Send {
    /// Registration; may be a no-op for scan-based implementations.
    fn register_poll_event(&mut self, fd: RawFd, ev: EventType);
    fn unregister_poll_event(&mut self, fd: RawFd, ev: EventType);
    fn register_timeout_event(&mut self, fd: RawFd);
    fn unregister_timeout_event(&mut self, fd: RawFd);
    fn unregister_descriptor(&mut self, fd: RawFd);

    /// Phase 1: called with the worker lock held.
    fn prepare(&mut self, descriptors: &DescriptorMap);

    /// Phase 2: called with the worker lock released. Returns the number of
    /// descriptors ready, `0` on timeout, `-1` on failure (`errno` already
    /// consumed into a log line by the implementation).
    fn wait(&mut self, timeout: Duration) -> i32;

    /// Phase 3: called with the worker lock held. Harvests callbacks for
    /// descriptors with priority above `min_priority` and returns whether
    /// the poll breaker broke the wait.
    fn collect(
        &mut self,
        descriptors: &DescriptorMap,
        min_priority: Option<Priority>,
        callbacks: &mut CallbackQueue,
    ) -> bool;
}

/// The write end paired with a poller's breaker. Safe to use from any
/// thread; wake-ups are coalesced.
#[derive(Debug)]
pub struct Signaler {
    sock: ScopedSocket,
}

impl Signaler {
    pub fn new(sock: ScopedSocket) -> Signaler {
        Signaler { sock }
    }

    /// Idempotent wakeup.
    pub fn signal(&self) {
        match self.sock.write(&[0]) {
            Ok(_) => {}
            // Pipe full: the poller has unread wakeups pending anyway.
            Err(err) if is_retryable(&err) => {}
            Err(err) => warn!("poll signal failed: {}", err),
        }
    }
}

/// Selects the OS-native poller. The breaker read end is registered for
/// read interest before the first wait.
pub fn new_descriptor_poller(breaker: ScopedSocket) -> Box<dyn DescriptorPoller> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        match EpollPoller::new(breaker) {
            Ok(p) => return Box::new(p),
            Err(err) => panic!("epoll_create1 failed: {}", err),
        }
    }
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        match KqueuePoller::new(breaker) {
            Ok(p) => return Box::new(p),
            Err(err) => panic!("kqueue failed: {}", err),
        }
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    {
        Box::new(SelectPoller::new(breaker))
    }
}

/// Drains every byte pending on a breaker socket.
pub(crate) fn drain_breaker(breaker: &ScopedSocket) {
    let mut buf = [0u8; 256];
    loop {
        match breaker.read(&mut buf) {
            Ok(n) if n > 0 => continue,
            _ => return,
        }
    }
}

/// Harvests ready callbacks for one fired descriptor: the read callback if
/// readable, the write callback if writable, and the timeout check if the
/// descriptor fired but neither callback was taken.
pub(crate) fn harvest_fired(
    d: &Arc<SocketDescriptor>,
    readable: bool,
    writable: bool,
    min_priority: Option<Priority>,
    callbacks: &mut CallbackQueue,
) {
    if let Some(min) = min_priority {
        if d.priority() <= min {
            return;
        }
    }
    let mut idle = true;
    if readable {
        if let Some(task) = d.readable_task() {
            callbacks.push((d.priority(), task));
            idle = false;
        }
    }
    if writable {
        if let Some(task) = d.writable_task() {
            callbacks.push((d.priority(), task));
            idle = false;
        }
    }
    if idle {
        if let Some(task) = d.timeout_task() {
            callbacks.push((d.priority(), task));
        }
    }
}

/// Harvests timeout checks after a wait that fired nothing.
pub(crate) fn harvest_timeouts<'a, I>(
    descriptors: I,
    min_priority: Option<Priority>,
    callbacks: &mut CallbackQueue,
) where
    I: Iterator<Item = &'a Arc<SocketDescriptor>>,
{
    for d in descriptors {
        if let Some(min) = min_priority {
            if d.priority() <= min {
                continue;
            }
        }
        if d.wait_readable() || d.wait_writable() {
            if let Some(task) = d.timeout_task() {
                callbacks.push((d.priority(), task));
            }
        }
    }
}
