//! A single worker thread and its dispatch loop.

use std::cell::RefCell;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, trace, warn};

use super::{PeriodicTaskId, PoolId, Priority, WorkerId};
use crate::descriptor::SocketDescriptor;
use crate::io::ScopedSocket;
use crate::net::breaker_pair;
use crate::poller::{
    new_descriptor_poller, CallbackQueue, DescriptorMap, DescriptorPoller, EventType,
    Signaler,
};
use crate::task::{CancelableTask, PermanentTask, Task};

pub(crate) const NUM_PRIORITIES: usize = 4;

/// Default descriptor polling timeout. Reduced to zero when lower-priority
/// tasks are already waiting, and to the nearest delayed task otherwise.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A task running longer than this gets a warning with its call site.
const LONG_TASK_WARNING: Duration = Duration::from_secs(60);

const ALL_PRIORITIES: [Priority; NUM_PRIORITIES] = [
    Priority::Immediate,
    Priority::High,
    Priority::Med,
    Priority::Low,
];

thread_local! {
    static CURRENT_WORKER: RefCell<Weak<WorkerThread>> = RefCell::new(Weak::new());
}

struct TaskEntry {
    location: &'static str,
    task: Task,
    enqueued: Instant,
    queuelen: usize,
}

struct DelayedEntry {
    due: Instant,
    task: Arc<CancelableTask>,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; earliest due time wins.
        other.due.cmp(&self.due)
    }
}

struct PeriodicEntry {
    id: PeriodicTaskId,
    location: &'static str,
    period: Duration,
    last: Instant,
    task: PermanentTask,
}

struct Inner {
    queues: [VecDeque<TaskEntry>; NUM_PRIORITIES],
    max_queuelen: [usize; NUM_PRIORITIES],
    max_wait: [Duration; NUM_PRIORITIES],
    delayed: BinaryHeap<DelayedEntry>,
    periodics: Vec<PeriodicEntry>,
    descriptors: DescriptorMap,
    running_location: Option<&'static str>,
    shutting_down: bool,
    quit: bool,
    tick: u64,
}

impl Inner {
    fn add_task(&mut self, location: &'static str, priority: Priority, task: Task, now: Instant) {
        let q = &mut self.queues[priority.index()];
        q.push_back(TaskEntry {
            location,
            task,
            enqueued: now,
            queuelen: q.len(),
        });
        let len = q.len();
        let p = priority.index();
        if len > self.max_queuelen[p] {
            self.max_queuelen[p] = len;
        }
    }

    fn pop_task(&mut self, priority: Priority, now: Instant) -> Option<TaskEntry> {
        let entry = self.queues[priority.index()].pop_front()?;
        let waited = now.saturating_duration_since(entry.enqueued);
        let p = priority.index();
        if waited > self.max_wait[p] {
            self.max_wait[p] = waited;
        }
        Some(entry)
    }

    fn has_pending(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }
}

enum NextAction {
    Run(TaskEntry),
    Idle,
    Quit,
}

/// One OS thread of a [`super::WorkerPool`]: four priority queues, a
/// delayed-task heap, the periodic list (alarm worker only), the
/// descriptor map, a descriptor poller, and the signaling pair that wakes
/// the poller when work arrives from another thread.
pub struct WorkerThread {
    pool: PoolId,
    id: WorkerId,
    name: String,
    self_ref: Weak<WorkerThread>,
    signaler: Signaler,
    inner: Mutex<Inner>,
    // Only ever locked by the owning thread (registration happens from
    // descriptor methods, which are thread-confined); the mutex exists to
    // make the container Sync.
    poller: Mutex<Box<dyn DescriptorPoller>>,
    thread_id: OnceLock<thread::ThreadId>,
    now: Mutex<Instant>,
}

impl WorkerThread {
    pub(super) fn new(
        pool: PoolId,
        id: WorkerId,
        name: String,
    ) -> io::Result<Arc<WorkerThread>> {
        let (breaker, signaler) = breaker_pair()?;
        let poller = new_descriptor_poller(breaker);
        Ok(Arc::new_cyclic(|self_ref| WorkerThread {
            pool,
            id,
            name,
            self_ref: self_ref.clone(),
            signaler: Signaler::new(signaler),
            inner: Mutex::new(Inner {
                queues: Default::default(),
                max_queuelen: [0; NUM_PRIORITIES],
                max_wait: [Duration::ZERO; NUM_PRIORITIES],
                delayed: BinaryHeap::new(),
                periodics: Vec::new(),
                descriptors: DescriptorMap::new(),
                running_location: None,
                shutting_down: false,
                quit: false,
                tick: 0,
            }),
            poller: Mutex::new(poller),
            thread_id: OnceLock::new(),
            now: Mutex::new(Instant::now()),
        }))
    }

    pub(super) fn start(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let me = Arc::clone(self);
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || me.thread_main())
    }

    /// The worker running the calling thread, if any.
    pub fn current() -> Option<Arc<WorkerThread>> {
        CURRENT_WORKER.with(|w| w.borrow().upgrade())
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self) -> bool {
        self.thread_id.get().copied() == Some(thread::current().id())
    }

    pub(crate) fn assert_on_thread(&self) {
        debug_assert!(
            self.thread_id.get().is_none() || self.is_current(),
            "descriptor touched off its owning thread"
        );
    }

    /// The time cached at the top of the current dispatch iteration.
    pub(crate) fn now_cached(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn me(&self) -> Arc<WorkerThread> {
        self.self_ref.upgrade().expect("worker gone")
    }

    /// Enqueues `task`. Submissions from the worker's own thread, or while
    /// it is busy running a task, skip the poller wakeup: the next dispatch
    /// iteration will see the queue.
    pub fn run_task(&self, location: &'static str, task: Task, priority: Priority) {
        let need_signal = {
            let mut inner = self.inner.lock().unwrap();
            inner.add_task(location, priority, task, Instant::now());
            !self.is_current() && inner.running_location.is_none()
        };
        if need_signal {
            self.signaler.signal();
        }
    }

    /// Enqueues `task` to run once `delay` has elapsed, at `Immediate`.
    pub fn run_delayed(
        &self,
        location: &'static str,
        delay: Duration,
        task: Task,
    ) -> Arc<CancelableTask> {
        let cancelable = CancelableTask::new(location, task);
        let need_signal = {
            let mut inner = self.inner.lock().unwrap();
            inner.delayed.push(DelayedEntry {
                due: Instant::now() + delay,
                task: Arc::clone(&cancelable),
            });
            !self.is_current() && inner.running_location.is_none()
        };
        if need_signal {
            // Wake the poller so it can shorten its wait to the due time.
            self.signaler.signal();
        }
        cancelable
    }

    pub(super) fn register_periodic(
        &self,
        id: PeriodicTaskId,
        location: &'static str,
        period: Duration,
        task: PermanentTask,
    ) {
        let need_signal = {
            let mut inner = self.inner.lock().unwrap();
            inner.periodics.push(PeriodicEntry {
                id,
                location,
                period,
                last: Instant::now(),
                task,
            });
            !self.is_current() && inner.running_location.is_none()
        };
        if need_signal {
            self.signaler.signal();
        }
    }

    /// Removes a periodic task and drains any queued instances of it. Runs
    /// on the owning thread via the unregistration task.
    pub(super) fn remove_periodic(&self, id: PeriodicTaskId) {
        self.assert_on_thread();
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.periodics.iter().position(|p| p.id == id) else {
            warn!("removing unregistered periodic task id={:?}", id);
            return;
        };
        let entry = inner.periodics.remove(pos);
        inner.queues[Priority::Immediate.index()]
            .retain(|e| !e.task.is_instance_of(&entry.task));
    }

    /// Creates and owns a descriptor for `sock`.
    pub fn register_socket(
        &self,
        sock: ScopedSocket,
        priority: Priority,
    ) -> Arc<SocketDescriptor> {
        debug_assert!(priority < Priority::Immediate);
        let d = SocketDescriptor::new(sock, priority, self.me());
        let mut inner = self.inner.lock().unwrap();
        let prev = inner.descriptors.insert(d.fd(), Arc::clone(&d));
        debug_assert!(prev.is_none(), "fd {} registered twice", d.fd());
        d
    }

    /// Unregisters `d` everywhere and returns the underlying socket.
    pub fn delete_socket(&self, d: &Arc<SocketDescriptor>) -> ScopedSocket {
        self.assert_on_thread();
        self.poller.lock().unwrap().unregister_descriptor(d.fd());
        let sock = d.release_fd();
        if sock.valid() {
            self.inner.lock().unwrap().descriptors.remove(&sock.get());
        }
        sock
    }

    pub(crate) fn register_poll_event(&self, fd: std::os::fd::RawFd, ev: EventType) {
        self.poller.lock().unwrap().register_poll_event(fd, ev);
    }

    pub(crate) fn unregister_poll_event(&self, fd: std::os::fd::RawFd, ev: EventType) {
        self.poller.lock().unwrap().unregister_poll_event(fd, ev);
    }

    pub(crate) fn register_timeout_event(&self, fd: std::os::fd::RawFd) {
        self.poller.lock().unwrap().register_timeout_event(fd);
    }

    pub(crate) fn unregister_timeout_event(&self, fd: std::os::fd::RawFd) {
        self.poller.lock().unwrap().unregister_timeout_event(fd);
    }

    /// Runs delayed tasks as soon as possible.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.signaler.signal();
    }

    /// Requests the dispatch loop to drain and exit.
    pub fn quit(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutting_down = true;
        inner.quit = true;
        drop(inner);
        self.signaler.signal();
    }

    /// Weighted queue depth plus live descriptors; used for load balancing.
    pub fn load(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut n = 0;
        if inner.running_location.is_some() {
            n += 1;
        }
        n += inner.descriptors.len();
        for (i, q) in inner.queues.iter().enumerate() {
            n += q.len() << i;
        }
        n
    }

    pub fn pendings(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.running_location.is_none() && inner.descriptors.is_empty()
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut s = format!(
            "thread[{}/{:?}] tick={} {}: {} descriptors: ",
            self.name,
            self.id,
            inner.tick,
            inner.running_location.unwrap_or("-"),
            inner.descriptors.len()
        );
        for p in ALL_PRIORITIES.iter().rev() {
            let i = p.index();
            s.push_str(&format!(
                "{}[{} pendings q={} w={:?}] ",
                p.name(),
                inner.queues[i].len(),
                inner.max_queuelen[i],
                inner.max_wait[i]
            ));
        }
        s.push_str(&format!(
            ": delayed={} periodic={}",
            inner.delayed.len(),
            inner.periodics.len()
        ));
        s
    }

    fn thread_main(self: Arc<Self>) {
        self.thread_id
            .set(thread::current().id())
            .expect("worker started twice");
        CURRENT_WORKER.with(|w| *w.borrow_mut() = Arc::downgrade(&self));
        trace!("start worker {}", self.name);
        loop {
            if !self.dispatch() {
                break;
            }
        }
        info!("{} dispatch loop finished", self.name);
        let inner = self.inner.lock().unwrap();
        debug_assert!(inner.quit);
        if !inner.descriptors.is_empty() {
            warn!(
                "{} exits with {} descriptors still registered",
                self.name,
                inner.descriptors.len()
            );
        }
    }

    /// One iteration: find the next task and run it. Returns false when the
    /// loop should exit.
    fn dispatch(&self) -> bool {
        *self.now.lock().unwrap() = Instant::now();
        match self.next_task() {
            NextAction::Quit => false,
            NextAction::Idle => true,
            NextAction::Run(entry) => {
                let start = Instant::now();
                entry.task.run();
                let elapsed = start.elapsed();
                if elapsed > LONG_TASK_WARNING {
                    warn!(
                        "{} task ran too long: {:?} at {} (queued behind {})",
                        self.name, elapsed, entry.location, entry.queuelen
                    );
                }
                self.inner.lock().unwrap().running_location = None;
                true
            }
        }
    }

    fn next_task(&self) -> NextAction {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let now = self.now_cached();

        // Immediate tasks outrank descriptor I/O.
        if let Some(entry) = inner.pop_task(Priority::Immediate, now) {
            inner.running_location = Some(entry.location);
            return NextAction::Run(entry);
        }

        let mut poll_interval = POLL_INTERVAL;
        let mut min_priority = None;
        for p in [Priority::High, Priority::Med, Priority::Low] {
            if !inner.queues[p.index()].is_empty() {
                // Check descriptor readiness before draining this level,
                // but do not wait for it.
                poll_interval = Duration::ZERO;
                min_priority = Some(p);
                break;
            }
        }
        if inner.shutting_down {
            poll_interval = Duration::ZERO;
        } else if poll_interval > Duration::ZERO {
            if let Some(next) = inner.delayed.peek() {
                poll_interval =
                    poll_interval.min(next.due.saturating_duration_since(now));
            }
        }

        let mut poller = self.poller.lock().unwrap();
        poller.prepare(&inner.descriptors);
        drop(inner);

        let wait_start = Instant::now();
        let fired = poller.wait(poll_interval);
        let now = Instant::now();
        *self.now.lock().unwrap() = now;

        let mut inner = self.inner.lock().unwrap();
        let mut callbacks = CallbackQueue::new();
        if fired >= 0 {
            poller.collect(&inner.descriptors, min_priority, &mut callbacks);
        }
        drop(poller);

        let waited = now.saturating_duration_since(wait_start);
        if poll_interval > Duration::ZERO && waited > poll_interval.mul_f64(1.1) {
            warn!(
                "{} poll too slow: {:?} interval={:?} #descriptors={}",
                self.name,
                waited,
                poll_interval,
                inner.descriptors.len()
            );
            if waited > Duration::from_secs(1) {
                for (fd, d) in &inner.descriptors {
                    warn!(
                        "{} socket on slow poll: fd={} closed={} canreuse={} err={}",
                        self.name,
                        fd,
                        crate::descriptor::Descriptor::is_closed(d.as_ref()),
                        crate::descriptor::Descriptor::can_reuse(d.as_ref()),
                        crate::descriptor::Descriptor::last_error_message(d.as_ref())
                    );
                }
            }
        }

        // Promote due delayed tasks; shutdown promotes all of them.
        loop {
            let due = match inner.delayed.peek() {
                Some(top) => top.due <= now || inner.shutting_down,
                None => false,
            };
            if !due {
                break;
            }
            let entry = inner.delayed.pop().unwrap();
            let cancelable = entry.task;
            let location = cancelable.location();
            inner.add_task(
                location,
                Priority::Immediate,
                Task::oneshot(move || cancelable.run()),
                now,
            );
        }

        // Fire periodic tasks that reached their period.
        let mut fired_periodics = Vec::new();
        for p in &mut inner.periodics {
            if now.saturating_duration_since(p.last) >= p.period {
                p.last = now;
                fired_periodics.push((p.location, p.task.to_task()));
            }
        }
        for (location, task) in fired_periodics {
            inner.add_task(location, Priority::Immediate, task, now);
        }

        // Queue harvested descriptor callbacks at their priorities.
        for (priority, task) in callbacks {
            inner.add_task("descriptor i/o", priority, task, now);
        }

        for p in ALL_PRIORITIES {
            if let Some(entry) = inner.pop_task(p, now) {
                inner.running_location = Some(entry.location);
                return NextAction::Run(entry);
            }
        }

        if inner.quit && !inner.has_pending() && inner.delayed.is_empty() {
            return NextAction::Quit;
        }
        NextAction::Idle
    }
}
