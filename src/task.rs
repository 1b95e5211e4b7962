//! Units of deferred work run by worker threads.
//!
//! A [`Task`] is either *one-shot* (consumed by its first run; may capture
//! move-only values) or *permanent* (re-runnable; shared through a
//! [`PermanentTask`] handle). A [`CancelableTask`] wraps a task behind a
//! nullable slot so its target can be dropped before invocation while the
//! shell drains harmlessly through the queues.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Expands to a `&'static str` naming the call site, used as the `location`
/// tag on submitted tasks.
#[macro_export]
macro_rules! from_here {
    () => {
        concat!(file!(), ":", line!())
    };
}

enum Repr {
    Oneshot(Box<dyn FnOnce() + Send + 'static>),
    Permanent(Arc<dyn Fn() + Send + Sync + 'static>),
}

/// An opaque unit of deferred work.
pub struct Task {
    repr: Repr,
}

impl Task {
    /// A task consumed and destroyed after its first run. May capture
    /// move-only values.
    pub fn oneshot<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            repr: Repr::Oneshot(Box::new(f)),
        }
    }

    /// Runs the task. One-shot bodies are consumed; a permanent body only
    /// drops this handle to it.
    pub fn run(self) {
        match self.repr {
            Repr::Oneshot(f) => f(),
            Repr::Permanent(f) => f(),
        }
    }

    /// Whether this task shares the body of `p`.
    ///
    /// Used when a permanent task is being unregistered and queued
    /// occurrences of it must be drained.
    pub fn is_instance_of(&self, p: &PermanentTask) -> bool {
        match &self.repr {
            Repr::Oneshot(_) => false,
            Repr::Permanent(f) => Arc::ptr_eq(f, &p.body),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            Repr::Oneshot(_) => f.write_str("Task::Oneshot"),
            Repr::Permanent(_) => f.write_str("Task::Permanent"),
        }
    }
}

/// A re-runnable task body. Holders enqueue fresh [`Task`] instances of it
/// with [`PermanentTask::to_task`]; the body itself is shared.
///
/// Permanent tasks cannot capture move-only values: the body may run any
/// number of times.
#[derive(Clone)]
pub struct PermanentTask {
    body: Arc<dyn Fn() + Send + Sync + 'static>,
}

impl PermanentTask {
    pub fn new<F>(f: F) -> PermanentTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        PermanentTask { body: Arc::new(f) }
    }

    /// A queueable instance sharing this body.
    pub fn to_task(&self) -> Task {
        Task {
            repr: Repr::Permanent(Arc::clone(&self.body)),
        }
    }

    /// Runs the body in place.
    pub fn run(&self) {
        (self.body)();
    }

    pub fn ptr_eq(&self, other: &PermanentTask) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for PermanentTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PermanentTask")
    }
}

/// A task behind a nullable slot.
///
/// `cancel` drops the inner task; the shell left in a queue runs as a
/// no-op. Delayed tasks are always wrapped in one of these so callers can
/// revoke them before their due time.
pub struct CancelableTask {
    location: &'static str,
    slot: Mutex<Option<Task>>,
}

impl CancelableTask {
    pub fn new(location: &'static str, task: Task) -> Arc<CancelableTask> {
        Arc::new(CancelableTask {
            location,
            slot: Mutex::new(Some(task)),
        })
    }

    /// Drops the inner task. Idempotent.
    pub fn cancel(&self) {
        self.slot.lock().unwrap().take();
    }

    /// Runs the inner task if it has not been canceled.
    pub fn run(&self) {
        let task = self.slot.lock().unwrap().take();
        if let Some(task) = task {
            task.run();
        }
    }

    pub fn location(&self) -> &'static str {
        self.location
    }
}

impl fmt::Debug for CancelableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableTask")
            .field("location", &self.location)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn oneshot_captures_move_only() {
        let owned = String::from("payload");
        let out = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&out);
        let task = Task::oneshot(move || {
            *sink.lock().unwrap() = owned;
        });
        task.run();
        assert_eq!(*out.lock().unwrap(), "payload");
    }

    #[test]
    fn permanent_runs_many_times() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let p = PermanentTask::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        p.to_task().run();
        p.to_task().run();
        p.run();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn canceled_task_is_a_no_op() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let cancelable = CancelableTask::new(
            from_here!(),
            Task::oneshot(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cancelable.cancel();
        cancelable.run();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn instance_identity_tracks_body() {
        let p = PermanentTask::new(|| {});
        let q = PermanentTask::new(|| {});
        assert!(p.to_task().is_instance_of(&p));
        assert!(!p.to_task().is_instance_of(&q));
        assert!(!Task::oneshot(|| {}).is_instance_of(&p));
    }
}
