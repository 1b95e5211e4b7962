//! kqueue-backed descriptor poller (macOS, the BSDs).

use std::collections::HashSet;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use log::warn;

use super::{
    drain_breaker, harvest_fired, harvest_timeouts, CallbackQueue, DescriptorMap,
    DescriptorPoller, EventType,
};
use crate::io::ScopedSocket;
use crate::worker::Priority;

const EVENT_CAPACITY: usize = 128;

pub struct KqueuePoller {
    kq: RawFd,
    breaker: ScopedSocket,
    events: Vec<libc::kevent>,
    nevents: i32,
    timeout_fds: HashSet<RawFd>,
}

impl KqueuePoller {
    pub fn new(breaker: ScopedSocket) -> io::Result<KqueuePoller> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(err);
        }
        let mut poller = KqueuePoller {
            kq,
            breaker,
            events: Vec::with_capacity(EVENT_CAPACITY),
            nevents: 0,
            timeout_fds: HashSet::new(),
        };
        poller.change(poller.breaker.get(), libc::EVFILT_READ, libc::EV_ADD)?;
        Ok(poller)
    }

    fn change(&mut self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let r = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl DescriptorPoller for KqueuePoller {
    fn register_poll_event(&mut self, fd: RawFd, ev: EventType) {
        let filter = match ev {
            EventType::Read => libc::EVFILT_READ,
            EventType::Write => libc::EVFILT_WRITE,
        };
        if let Err(err) = self.change(fd, filter, libc::EV_ADD) {
            warn!("kevent(EV_ADD) fd={} failed: {}", fd, err);
        }
    }

    fn unregister_poll_event(&mut self, fd: RawFd, ev: EventType) {
        let filter = match ev {
            EventType::Read => libc::EVFILT_READ,
            EventType::Write => libc::EVFILT_WRITE,
        };
        // ENOENT means the filter was never added or already removed.
        let _ = self.change(fd, filter, libc::EV_DELETE);
    }

    fn register_timeout_event(&mut self, fd: RawFd) {
        self.timeout_fds.insert(fd);
    }

    fn unregister_timeout_event(&mut self, fd: RawFd) {
        self.timeout_fds.remove(&fd);
    }

    fn unregister_descriptor(&mut self, fd: RawFd) {
        self.timeout_fds.remove(&fd);
        let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
    }

    fn prepare(&mut self, _descriptors: &DescriptorMap) {}

    fn wait(&mut self, timeout: Duration) -> i32 {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                &ts,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!("kevent failed: {}", err);
            }
            self.nevents = 0;
            return -1;
        }
        unsafe { self.events.set_len(n as usize) };
        self.nevents = n;
        n
    }

    fn collect(
        &mut self,
        descriptors: &DescriptorMap,
        min_priority: Option<Priority>,
        callbacks: &mut CallbackQueue,
    ) -> bool {
        if self.nevents == 0 {
            harvest_timeouts(
                self.timeout_fds
                    .iter()
                    .filter_map(|fd| descriptors.get(fd)),
                min_priority,
                callbacks,
            );
            return false;
        }

        let mut broke = false;
        for i in 0..self.nevents as usize {
            let ev = self.events[i];
            let fd = ev.ident as RawFd;
            if fd == self.breaker.get() {
                drain_breaker(&self.breaker);
                broke = true;
                continue;
            }
            let d = match descriptors.get(&fd) {
                Some(d) => d,
                None => continue,
            };
            let readable =
                ev.filter == libc::EVFILT_READ || ev.flags & libc::EV_EOF != 0;
            let writable = ev.filter == libc::EVFILT_WRITE;
            harvest_fired(d, readable, writable, min_priority, callbacks);
        }
        self.nevents = 0;
        broke
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
