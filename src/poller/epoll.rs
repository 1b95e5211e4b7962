//! epoll-backed descriptor poller (Linux, Android).

use std::cmp;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use log::warn;

use super::{
    drain_breaker, harvest_fired, harvest_timeouts, CallbackQueue, DescriptorMap,
    DescriptorPoller, EventType,
};
use crate::io::ScopedSocket;
use crate::worker::Priority;

const EVENT_CAPACITY: usize = 128;

pub struct EpollPoller {
    epfd: RawFd,
    breaker: ScopedSocket,
    events: Vec<libc::epoll_event>,
    nevents: i32,
    // Composed level-triggered interest per fd, mirrored into the kernel
    // set with ADD/MOD/DEL.
    interests: HashMap<RawFd, (bool, bool)>,
    timeout_fds: HashSet<RawFd>,
}

impl EpollPoller {
    pub fn new(breaker: ScopedSocket) -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let poller = EpollPoller {
            epfd,
            breaker,
            events: Vec::with_capacity(EVENT_CAPACITY),
            nevents: 0,
            interests: HashMap::new(),
            timeout_fds: HashSet::new(),
        };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.breaker.get(),
            libc::EPOLLIN as u32,
        )?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let r = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn apply(&mut self, fd: RawFd, prev: Option<(bool, bool)>) {
        let next = self.interests.get(&fd).copied();
        let result = match (prev, next) {
            (None, Some((r, w))) => self.ctl(libc::EPOLL_CTL_ADD, fd, epoll_mask(r, w)),
            (Some(_), Some((r, w))) => self.ctl(libc::EPOLL_CTL_MOD, fd, epoll_mask(r, w)),
            (Some(_), None) => self.ctl(libc::EPOLL_CTL_DEL, fd, 0),
            (None, None) => Ok(()),
        };
        if let Err(err) = result {
            // EBADF races with descriptor teardown; everything else is a bug
            // worth hearing about.
            warn!("epoll_ctl fd={} failed: {}", fd, err);
        }
    }
}

fn epoll_mask(read: bool, write: bool) -> u32 {
    let mut mask = 0u32;
    if read {
        mask |= libc::EPOLLIN as u32;
    }
    if write {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

impl DescriptorPoller for EpollPoller {
    fn register_poll_event(&mut self, fd: RawFd, ev: EventType) {
        let prev = self.interests.get(&fd).copied();
        let entry = self.interests.entry(fd).or_insert((false, false));
        match ev {
            EventType::Read => entry.0 = true,
            EventType::Write => entry.1 = true,
        }
        self.apply(fd, prev);
    }

    fn unregister_poll_event(&mut self, fd: RawFd, ev: EventType) {
        let prev = match self.interests.get(&fd).copied() {
            Some(prev) => prev,
            None => return,
        };
        let entry = self.interests.get_mut(&fd).unwrap();
        match ev {
            EventType::Read => entry.0 = false,
            EventType::Write => entry.1 = false,
        }
        if *entry == (false, false) {
            self.interests.remove(&fd);
        }
        self.apply(fd, Some(prev));
    }

    fn register_timeout_event(&mut self, fd: RawFd) {
        self.timeout_fds.insert(fd);
    }

    fn unregister_timeout_event(&mut self, fd: RawFd) {
        self.timeout_fds.remove(&fd);
    }

    fn unregister_descriptor(&mut self, fd: RawFd) {
        self.timeout_fds.remove(&fd);
        if self.interests.remove(&fd).is_some() {
            if let Err(err) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
                warn!("epoll_ctl(DEL) fd={} failed: {}", fd, err);
            }
        }
    }

    fn prepare(&mut self, _descriptors: &DescriptorMap) {
        // Interest is maintained incrementally; nothing to scan.
    }

    fn wait(&mut self, timeout: Duration) -> i32 {
        let timeout_ms = cmp::min(timeout.as_millis(), i32::MAX as u128) as i32;
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!("epoll_wait failed: {}", err);
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
            let fd = ev.u64 as RawFd;
            if fd == self.breaker.get() {
                drain_breaker(&self.breaker);
                broke = true;
                continue;
            }
            let d = match descriptors.get(&fd) {
                Some(d) => d,
                None => continue,
            };
            let mask = ev.events as libc::c_int;
            let readable =
                mask & (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) != 0;
            let writable =
                mask & (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) != 0;
            harvest_fired(d, readable, writable, min_priority, callbacks);
        }
        self.nevents = 0;
        broke
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
