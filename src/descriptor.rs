//! Socket descriptors bound to a worker thread.
//!
//! A [`SocketDescriptor`] marries an owned socket with its readiness
//! callbacks and per-operation error state. Once registered with a
//! [`WorkerThread`], a descriptor is only read from, written to, re-armed,
//! or destroyed on that thread; the worker strictly owns it and the
//! descriptor holds a back-reference used only from the owning thread.
//!
//! At most one read-ready and one write-ready callback derived from a
//! descriptor is pending in the worker queue at any time, tracked by the
//! `*_in_queue` flags. The timeout callback fires only when both read and
//! write are idle and the elapsed time since the last activity exceeds the
//! configured duration.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{info, log_enabled, trace, warn};

use crate::io::{is_retryable, ScopedSocket};
use crate::poller::EventType;
use crate::task::{PermanentTask, Task};
use crate::worker::{Priority, WorkerThread};

/// Event-driven I/O surface shared by plain and TLS descriptors.
///
/// `read`/`write` never block: `Ok(0)` from `read` means the peer closed,
/// and [`io::ErrorKind::WouldBlock`] means "re-arm and wait" (also
/// reported through `need_retry`).
pub trait Descriptor: Send + Sync {
    /// Arms the permanent read callback.
    fn notify_when_readable(&self, task: PermanentTask);
    /// Arms the permanent write callback.
    fn notify_when_writable(&self, task: PermanentTask);
    fn clear_readable(&self);
    fn clear_writable(&self);
    /// Arms a one-shot idle-timeout callback. Timing is re-armed on every
    /// successful read or write.
    fn notify_when_timedout(&self, timeout: Duration, task: Task);
    fn change_timeout(&self, timeout: Duration);
    fn clear_timeout(&self);
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn need_retry(&self) -> bool;
    fn stop_read(&self);
    fn stop_write(&self);
    fn restart_read(&self);
    fn restart_write(&self);
    fn is_closed(&self) -> bool;
    fn can_reuse(&self) -> bool;
    fn last_error_message(&self) -> String;
}

struct State {
    readable: Option<PermanentTask>,
    writable: Option<PermanentTask>,
    timeout: Option<Duration>,
    timeout_task: Option<Task>,
    last_time: Instant,
    read_in_queue: bool,
    write_in_queue: bool,
    timeout_in_queue: bool,
    active_read: bool,
    active_write: bool,
    write_poll_registered: bool,
    is_closed: bool,
    need_retry: bool,
    last_error: String,
}

pub struct SocketDescriptor {
    raw: RawFd,
    priority: Priority,
    worker: Arc<WorkerThread>,
    self_ref: Weak<SocketDescriptor>,
    fd: Mutex<ScopedSocket>,
    state: Mutex<State>,
}

impl SocketDescriptor {
    pub(crate) fn new(
        fd: ScopedSocket,
        priority: Priority,
        worker: Arc<WorkerThread>,
    ) -> Arc<SocketDescriptor> {
        debug_assert!(fd.valid());
        debug_assert!(priority < Priority::Immediate);
        let raw = fd.get();
        let now = worker.now_cached();
        Arc::new_cyclic(|self_ref| SocketDescriptor {
            raw,
            priority,
            worker,
            self_ref: self_ref.clone(),
            fd: Mutex::new(fd),
            state: Mutex::new(State {
                readable: None,
                writable: None,
                timeout: None,
                timeout_task: None,
                last_time: now,
                read_in_queue: false,
                write_in_queue: false,
                timeout_in_queue: false,
                active_read: false,
                active_write: false,
                write_poll_registered: false,
                is_closed: false,
                need_retry: false,
                last_error: String::new(),
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.raw
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn worker(&self) -> &Arc<WorkerThread> {
        &self.worker
    }

    /// Takes the socket out; the descriptor is dead afterwards.
    pub(crate) fn release_fd(&self) -> ScopedSocket {
        let mut fd = self.fd.lock().unwrap();
        match fd.release() {
            Some(owned) => ScopedSocket::new(owned),
            None => ScopedSocket::invalid(),
        }
    }

    fn me(&self) -> Arc<SocketDescriptor> {
        self.self_ref
            .upgrade()
            .expect("descriptor used after removal from worker")
    }

    /// Whether the poller should watch this descriptor for read events.
    pub(crate) fn wait_readable(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.active_read && st.readable.is_some() && !st.read_in_queue
    }

    /// Whether the poller should watch this descriptor for write events.
    pub(crate) fn wait_writable(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.active_write && st.writable.is_some() && !st.write_in_queue
    }

    /// Bytes available to read without blocking.
    pub fn is_readable(&self) -> bool {
        let mut n: libc::c_int = 0;
        let r = unsafe { libc::ioctl(self.raw, libc::FIONREAD, &mut n) };
        if r < 0 {
            warn!("ioctl(FIONREAD) failed: fd={}", self.raw);
            return false;
        }
        n > 0
    }

    pub(crate) fn last_time(&self) -> Instant {
        self.state.lock().unwrap().last_time
    }

    /// Takes a one-shot wrapper for the read callback, marking it queued so
    /// a second wrapper is not produced while this one is pending.
    pub(crate) fn readable_task(&self) -> Option<Task> {
        let mut st = self.state.lock().unwrap();
        if !st.active_read || st.readable.is_none() || st.read_in_queue {
            return None;
        }
        st.read_in_queue = true;
        st.last_time = self.worker.now_cached();
        drop(st);
        let me = self.me();
        Some(Task::oneshot(move || me.run_read_callback()))
    }

    pub(crate) fn writable_task(&self) -> Option<Task> {
        let mut st = self.state.lock().unwrap();
        if !st.active_write || st.writable.is_none() || st.write_in_queue {
            return None;
        }
        st.write_in_queue = true;
        st.last_time = self.worker.now_cached();
        drop(st);
        let me = self.me();
        Some(Task::oneshot(move || me.run_write_callback()))
    }

    /// Takes a one-shot timeout check if the descriptor has sat idle past
    /// its configured duration and nothing else is pending for it.
    pub(crate) fn timeout_task(&self) -> Option<Task> {
        let mut st = self.state.lock().unwrap();
        let timeout = st.timeout?;
        if !st.active_read && !st.active_write {
            return None;
        }
        if st.read_in_queue || st.write_in_queue || st.timeout_in_queue {
            return None;
        }
        if self.worker.now_cached().duration_since(st.last_time) <= timeout {
            return None;
        }
        st.timeout_in_queue = true;
        drop(st);
        let me = self.me();
        Some(Task::oneshot(move || me.run_timeout_callback()))
    }

    fn run_read_callback(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.read_in_queue);
        st.read_in_queue = false;
        if !st.active_read {
            return;
        }
        let task = match &st.readable {
            Some(t) => t.clone(),
            None => return,
        };
        drop(st);
        task.run();
    }

    fn run_write_callback(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.write_in_queue);
        st.write_in_queue = false;
        if !st.active_write {
            return;
        }
        let task = match &st.writable {
            Some(t) => t.clone(),
            None => return,
        };
        drop(st);
        task.run();
    }

    fn run_timeout_callback(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        st.timeout_in_queue = false;
        if st.read_in_queue || st.write_in_queue {
            // I/O got scheduled while this check sat in the queue.
            return;
        }
        if !st.active_read && !st.active_write {
            return;
        }
        let timeout = match st.timeout {
            Some(t) => t,
            None => return,
        };
        if self.worker.now_cached().duration_since(st.last_time) <= timeout {
            return;
        }
        let task = st.timeout_task.take();
        drop(st);
        if let Some(task) = task {
            info!("socket timeout fd={} timeout={:?}", self.raw, timeout);
            task.run();
        }
    }

    fn record_io_error(&self, st: &mut State, err: &io::Error) {
        if is_retryable(err) {
            st.need_retry = true;
        } else {
            st.last_error = err.to_string();
        }
    }

    pub fn peer_name(&self) -> String {
        peer_name_of(self.raw)
    }
}

impl Descriptor for SocketDescriptor {
    fn notify_when_readable(&self, task: PermanentTask) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        st.readable = Some(task);
        st.last_time = self.worker.now_cached();
        st.active_read = true;
        drop(st);
        trace!("notify when fd={} readable", self.raw);
        self.worker.register_poll_event(self.raw, EventType::Read);
    }

    fn notify_when_writable(&self, task: PermanentTask) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        st.writable = Some(task);
        st.last_time = self.worker.now_cached();
        st.active_write = true;
        st.write_poll_registered = true;
        drop(st);
        trace!("notify when fd={} writable", self.raw);
        self.worker.register_poll_event(self.raw, EventType::Write);
    }

    fn clear_readable(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        st.readable = None;
        st.active_read = false;
        drop(st);
        self.worker.unregister_poll_event(self.raw, EventType::Read);
    }

    fn clear_writable(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        st.writable = None;
        st.active_write = false;
        let registered = st.write_poll_registered;
        st.write_poll_registered = false;
        drop(st);
        if registered {
            self.worker.unregister_poll_event(self.raw, EventType::Write);
        }
    }

    fn notify_when_timedout(&self, timeout: Duration, task: Task) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.timeout_task.is_none());
        st.timeout = Some(timeout);
        st.timeout_task = Some(task);
        st.last_time = self.worker.now_cached();
        drop(st);
        self.worker.register_timeout_event(self.raw);
    }

    fn change_timeout(&self, timeout: Duration) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.timeout_task.is_some());
        st.timeout = Some(timeout);
        st.last_time = self.worker.now_cached();
    }

    fn clear_timeout(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        st.timeout = None;
        st.timeout_task = None;
        drop(st);
        self.worker.unregister_timeout_event(self.raw);
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        debug_assert!(!buf.is_empty());
        let mut st = self.state.lock().unwrap();
        st.need_retry = false;
        st.last_time = self.worker.now_cached();
        drop(st);
        let r = self.fd.lock().unwrap().read(buf);
        let mut st = self.state.lock().unwrap();
        match &r {
            Ok(0) => st.is_closed = true,
            Ok(_) => {}
            Err(err) => self.record_io_error(&mut st, err),
        }
        r
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        debug_assert!(!buf.is_empty());
        let mut st = self.state.lock().unwrap();
        st.need_retry = false;
        st.last_time = self.worker.now_cached();
        drop(st);
        let r = self.fd.lock().unwrap().write(buf);
        if let Err(err) = &r {
            let mut st = self.state.lock().unwrap();
            self.record_io_error(&mut st, err);
        }
        r
    }

    fn need_retry(&self) -> bool {
        self.state.lock().unwrap().need_retry
    }

    fn stop_read(&self) {
        self.worker.assert_on_thread();
        self.state.lock().unwrap().active_read = false;
    }

    fn stop_write(&self) {
        self.worker.assert_on_thread();
        self.state.lock().unwrap().active_write = false;
    }

    fn restart_read(&self) {
        self.worker.assert_on_thread();
        self.state.lock().unwrap().active_read = true;
    }

    fn restart_write(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        st.active_write = true;
        if !st.write_poll_registered {
            st.write_poll_registered = true;
            drop(st);
            trace!("register write again: fd={}", self.raw);
            self.worker.register_poll_event(self.raw, EventType::Write);
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().is_closed
    }

    fn can_reuse(&self) -> bool {
        let st = self.state.lock().unwrap();
        !st.is_closed && st.last_error.is_empty()
    }

    fn last_error_message(&self) -> String {
        self.state.lock().unwrap().last_error.clone()
    }
}

impl SocketDescriptor {
    /// Half-closes the send direction.
    pub fn shutdown_for_send(&self) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.need_retry = false;
        st.last_time = self.worker.now_cached();
        drop(st);
        let r = self.fd.lock().unwrap().shutdown_for_send();
        if let Err(err) = &r {
            let mut st = self.state.lock().unwrap();
            self.record_io_error(&mut st, err);
        }
        r
    }

    /// Drops write poll interest if the application stopped writing, so an
    /// idle connection consumes no poller slot.
    pub fn unregister_writable(&self) {
        self.worker.assert_on_thread();
        let mut st = self.state.lock().unwrap();
        if !st.active_write && st.write_poll_registered {
            st.write_poll_registered = false;
            drop(st);
            self.worker.unregister_poll_event(self.raw, EventType::Write);
        }
    }
}

impl Drop for SocketDescriptor {
    fn drop(&mut self) {
        if log_enabled!(log::Level::Trace) {
            trace!("drop descriptor fd={}", self.raw);
        }
        let st = self.state.get_mut().unwrap();
        debug_assert!(!st.read_in_queue);
        debug_assert!(!st.write_in_queue);
        debug_assert!(!st.timeout_in_queue);
    }
}

fn peer_name_of(fd: RawFd) -> String {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let r = unsafe {
        libc::getpeername(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if r < 0 {
        return "<unknown>".to_string();
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = unsafe {
                &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)).to_string()
        }
        libc::AF_INET6 => {
            let addr = unsafe {
                &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr).to_string()
        }
        libc::AF_UNIX => "unix:<local>".to_string(),
        family => {
            warn!("unknown address family: {}", family);
            "<unknown-addr>".to_string()
        }
    }
}
