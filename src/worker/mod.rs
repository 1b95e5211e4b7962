//! Fixed pools of cooperative worker threads.
//!
//! A [`WorkerPool`] owns a dedicated alarm worker for periodic tasks plus
//! one or more pools of general workers (typically `num_cpus + 1` in the
//! default pool). Within one worker the dispatch loop is strictly
//! cooperative: a task suspends only by returning, and blocking I/O inside
//! a task is an error — long I/O is split through descriptor readiness
//! callbacks that re-enter the dispatcher.
//!
//! Ordering guarantees: tasks submitted to the same thread at the same
//! priority run FIFO; `Immediate` strictly preempts lower priorities at
//! dispatch time; cross-thread submissions become visible to the target
//! no later than its next return from the poll wait.

mod thread;

pub use self::thread::WorkerThread;

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::descriptor::SocketDescriptor;
use crate::io::ScopedSocket;
use crate::task::{CancelableTask, PermanentTask, Task};

/// Task priority classes, lowest first. `Immediate` is reserved for the
/// dispatcher itself (delayed promotions, periodic firings, unregistration)
/// and for callbacks that must preempt I/O handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    Med = 1,
    High = 2,
    Immediate = 3,
}

impl Priority {
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Med => "MED",
            Priority::High => "HIGH",
            Priority::Immediate => "IMMEDIATE",
        }
    }
}

/// Identifies a worker within its pool; stable for the pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

/// A worker pool tag. `DEFAULT_POOL` serves general work; dedicated pools
/// (e.g. the subprocess client's) are created with
/// [`WorkerPool::start_pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub usize);

pub const DEFAULT_POOL: PoolId = PoolId(0);
pub(crate) const ALARM_POOL: PoolId = PoolId(usize::MAX);

/// Handle of a registered periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicTaskId(u64);

struct PoolInner {
    workers: Vec<Arc<WorkerThread>>,
    handles: Vec<Option<JoinHandle<()>>>,
    next_pool: usize,
    next_periodic_id: u64,
    shutting_down: bool,
}

/// Owns every worker thread. One alarm worker runs all periodic tasks;
/// `run` picks the least-loaded worker of the default pool.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// Starts the alarm worker plus `num_threads` workers in the default
    /// pool.
    pub fn new(num_threads: usize) -> io::Result<Arc<WorkerPool>> {
        let pool = Arc::new(WorkerPool {
            inner: Mutex::new(PoolInner {
                workers: Vec::new(),
                handles: Vec::new(),
                next_pool: 1,
                next_periodic_id: 1,
                shutting_down: false,
            }),
        });
        pool.spawn_workers(ALARM_POOL, "alarm", 1)?;
        pool.spawn_workers(DEFAULT_POOL, "worker", num_threads)?;
        Ok(pool)
    }

    /// Starts a dedicated pool and returns its tag.
    pub fn start_pool(&self, name: &str, num_threads: usize) -> io::Result<PoolId> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = PoolId(inner.next_pool);
            inner.next_pool += 1;
            id
        };
        self.spawn_workers(id, name, num_threads)?;
        Ok(id)
    }

    fn spawn_workers(&self, pool: PoolId, name: &str, n: usize) -> io::Result<()> {
        for i in 0..n {
            let mut inner = self.inner.lock().unwrap();
            let id = WorkerId(inner.workers.len());
            let worker = WorkerThread::new(pool, id, format!("{}-{}", name, i))?;
            let handle = worker.start()?;
            inner.workers.push(worker);
            inner.handles.push(Some(handle));
        }
        Ok(())
    }

    fn alarm_worker(&self) -> Arc<WorkerThread> {
        let inner = self.inner.lock().unwrap();
        inner
            .workers
            .iter()
            .find(|w| w.pool() == ALARM_POOL)
            .cloned()
            .expect("alarm worker missing")
    }

    fn least_loaded(&self, pool: PoolId) -> Arc<WorkerThread> {
        let inner = self.inner.lock().unwrap();
        inner
            .workers
            .iter()
            .filter(|w| w.pool() == pool)
            .min_by_key(|w| w.load())
            .cloned()
            .expect("no worker in pool")
    }

    fn worker(&self, id: WorkerId) -> Arc<WorkerThread> {
        let inner = self.inner.lock().unwrap();
        inner.workers[id.0].clone()
    }

    /// Runs `task` on the least-loaded default-pool worker.
    pub fn run(&self, location: &'static str, task: Task, priority: Priority) {
        self.least_loaded(DEFAULT_POOL).run_task(location, task, priority);
    }

    pub fn run_in_pool(
        &self,
        pool: PoolId,
        location: &'static str,
        task: Task,
        priority: Priority,
    ) {
        self.least_loaded(pool).run_task(location, task, priority);
    }

    /// Runs `task` on a specific worker.
    pub fn run_in(
        &self,
        id: WorkerId,
        location: &'static str,
        task: Task,
        priority: Priority,
    ) {
        self.worker(id).run_task(location, task, priority);
    }

    /// Runs `task` after `delay` on the current worker (or the alarm worker
    /// when called from outside the pool). The returned handle cancels the
    /// task if it has not fired yet.
    pub fn run_after(
        &self,
        location: &'static str,
        delay: Duration,
        task: Task,
    ) -> Arc<CancelableTask> {
        match WorkerThread::current() {
            Some(w) => w.run_delayed(location, delay, task),
            None => self.alarm_worker().run_delayed(location, delay, task),
        }
    }

    pub fn run_delayed_in(
        &self,
        id: WorkerId,
        location: &'static str,
        delay: Duration,
        task: Task,
    ) -> Arc<CancelableTask> {
        self.worker(id).run_delayed(location, delay, task)
    }

    /// Registers `task` to run on the alarm worker every `period`.
    pub fn register_periodic(
        &self,
        location: &'static str,
        period: Duration,
        task: PermanentTask,
    ) -> PeriodicTaskId {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = PeriodicTaskId(inner.next_periodic_id);
            inner.next_periodic_id += 1;
            id
        };
        self.alarm_worker()
            .register_periodic(id, location, period, task);
        id
    }

    /// Unregisters a periodic task and blocks until the task body is
    /// provably no longer referenced by any queue. Must not be called from
    /// the alarm worker itself.
    pub fn unregister_periodic(&self, id: PeriodicTaskId) {
        let alarm = self.alarm_worker();
        debug_assert!(
            !alarm.is_current(),
            "unregister_periodic would deadlock on the alarm worker"
        );
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let done2 = Arc::clone(&done);
        let alarm2 = Arc::clone(&alarm);
        alarm.run_task(
            crate::from_here!(),
            Task::oneshot(move || {
                alarm2.remove_periodic(id);
                let (flag, cond) = &*done2;
                *flag.lock().unwrap() = true;
                cond.notify_all();
            }),
            Priority::Immediate,
        );
        let (flag, cond) = &*done;
        let mut removed = flag.lock().unwrap();
        while !*removed {
            removed = cond.wait(removed).unwrap();
        }
    }

    /// Registers `sock` on the current worker, or the least-loaded default
    /// worker when called from outside the pool.
    pub fn register_socket(
        &self,
        sock: ScopedSocket,
        priority: Priority,
    ) -> Arc<SocketDescriptor> {
        let worker = match WorkerThread::current() {
            Some(w) if w.pool() != ALARM_POOL => w,
            _ => self.least_loaded(DEFAULT_POOL),
        };
        worker.register_socket(sock, priority)
    }

    /// Removes `d` from its worker and returns the underlying socket.
    pub fn delete_socket(&self, d: &Arc<SocketDescriptor>) -> ScopedSocket {
        d.worker().clone().delete_socket(d)
    }

    pub fn shutting_down(&self) -> bool {
        self.inner.lock().unwrap().shutting_down
    }

    /// Asks every worker to run delayed tasks as soon as possible.
    pub fn shutdown(&self) {
        let workers: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.shutting_down = true;
            inner.workers.clone()
        };
        for w in workers {
            w.shutdown();
        }
    }

    /// Stops and joins every worker. Pending non-delayed tasks still queued
    /// are drained before the threads exit.
    pub fn join(&self) {
        let (workers, handles) = {
            let mut inner = self.inner.lock().unwrap();
            inner.shutting_down = true;
            let workers = inner.workers.clone();
            let handles: Vec<_> =
                inner.handles.iter_mut().map(|h| h.take()).collect();
            (workers, handles)
        };
        for w in &workers {
            w.quit();
        }
        for (w, handle) in workers.iter().zip(handles) {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("worker {} panicked", w.name());
                }
            }
        }
        info!("worker pool joined");
    }

    pub fn num_workers(&self) -> usize {
        self.inner.lock().unwrap().workers.len()
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut s = String::new();
        for w in &inner.workers {
            s.push_str(&w.debug_string());
            s.push('\n');
        }
        s
    }
}
