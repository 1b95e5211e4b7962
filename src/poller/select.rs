//! select(2)-backed descriptor poller, the portable fallback.
//!
//! There is no persistent kernel registration: each `prepare` scans the
//! worker's descriptor map for descriptors that are currently waiting.
//! When the waiting set exceeds `FD_SETSIZE`, the least-recently-armed
//! descriptors are deterministically evicted for this round and a counter
//! is logged; the poll breaker is never evicted.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use log::{info, warn};

use super::{
    drain_breaker, harvest_fired, harvest_timeouts, CallbackQueue, DescriptorMap,
    DescriptorPoller, EventType,
};
use crate::io::ScopedSocket;
use crate::worker::Priority;

pub struct SelectPoller {
    breaker: ScopedSocket,
    read_set: libc::fd_set,
    write_set: libc::fd_set,
    max_fd: RawFd,
    // Monotonic arming order; drives eviction when the set overflows.
    armed_tick: HashMap<RawFd, u64>,
    tick: u64,
    evicted: u64,
    nfired: i32,
}

impl SelectPoller {
    pub fn new(breaker: ScopedSocket) -> SelectPoller {
        assert!(
            (breaker.get() as usize) < libc::FD_SETSIZE,
            "poll breaker fd exceeds FD_SETSIZE"
        );
        SelectPoller {
            breaker,
            read_set: unsafe { mem::zeroed() },
            write_set: unsafe { mem::zeroed() },
            max_fd: -1,
            armed_tick: HashMap::new(),
            tick: 0,
            evicted: 0,
            nfired: 0,
        }
    }

    /// Evictions performed so far; exposed for the overflow log line.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl DescriptorPoller for SelectPoller {
    // Registration is scan-based; these only maintain arming order.
    fn register_poll_event(&mut self, fd: RawFd, _ev: EventType) {
        self.tick += 1;
        self.armed_tick.insert(fd, self.tick);
    }

    fn unregister_poll_event(&mut self, _fd: RawFd, _ev: EventType) {}

    fn register_timeout_event(&mut self, _fd: RawFd) {}

    fn unregister_timeout_event(&mut self, _fd: RawFd) {}

    fn unregister_descriptor(&mut self, fd: RawFd) {
        self.armed_tick.remove(&fd);
    }

    fn prepare(&mut self, descriptors: &DescriptorMap) {
        unsafe {
            libc::FD_ZERO(&mut self.read_set);
            libc::FD_ZERO(&mut self.write_set);
        }
        self.max_fd = self.breaker.get();
        unsafe { libc::FD_SET(self.breaker.get(), &mut self.read_set) };

        let mut waiting: Vec<&std::sync::Arc<crate::descriptor::SocketDescriptor>> =
            descriptors
                .values()
                .filter(|d| {
                    if d.fd() < 0 {
                        return false;
                    }
                    if d.fd() as usize >= libc::FD_SETSIZE {
                        warn!("fd {} exceeds FD_SETSIZE, skipped", d.fd());
                        return false;
                    }
                    d.wait_readable() || d.wait_writable()
                })
                .collect();

        if waiting.len() + 1 > libc::FD_SETSIZE {
            // Keep the most recently armed; drop the tail.
            waiting.sort_by_key(|d| {
                std::cmp::Reverse(self.armed_tick.get(&d.fd()).copied().unwrap_or(0))
            });
            let dropped = waiting.len() + 1 - libc::FD_SETSIZE;
            waiting.truncate(libc::FD_SETSIZE - 1);
            self.evicted += dropped as u64;
            info!(
                "waiting descriptors exceed FD_SETSIZE: dropped={} total_evicted={}",
                dropped, self.evicted
            );
        }

        for d in waiting {
            let fd = d.fd();
            if d.wait_readable() {
                unsafe { libc::FD_SET(fd, &mut self.read_set) };
                self.max_fd = self.max_fd.max(fd);
            }
            if d.wait_writable() {
                unsafe { libc::FD_SET(fd, &mut self.write_set) };
                self.max_fd = self.max_fd.max(fd);
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> i32 {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let n = unsafe {
            libc::select(
                self.max_fd + 1,
                &mut self.read_set,
                &mut self.write_set,
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!("select failed: {}", err);
            }
            self.nfired = 0;
            return -1;
        }
        self.nfired = n;
        n
    }

    fn collect(
        &mut self,
        descriptors: &DescriptorMap,
        min_priority: Option<Priority>,
        callbacks: &mut CallbackQueue,
    ) -> bool {
        if self.nfired == 0 {
            harvest_timeouts(descriptors.values(), min_priority, callbacks);
            return false;
        }

        let mut broke = false;
        if unsafe { libc::FD_ISSET(self.breaker.get(), &self.read_set) } {
            drain_breaker(&self.breaker);
            broke = true;
        }
        for d in descriptors.values() {
            let fd = d.fd();
            if fd < 0 || fd as usize >= libc::FD_SETSIZE {
                continue;
            }
            let readable = unsafe { libc::FD_ISSET(fd, &self.read_set) };
            let writable = unsafe { libc::FD_ISSET(fd, &self.write_set) };
            if readable || writable {
                harvest_fired(d, readable, writable, min_priority, callbacks);
            }
        }
        self.nfired = 0;
        broke
    }
}
