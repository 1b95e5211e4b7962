use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use remcc::descriptor::Descriptor;
use remcc::net::socketpair;
use remcc::task::{PermanentTask, Task};
use remcc::worker::{Priority, WorkerId, WorkerPool};
use remcc::{from_here, Result};

mod util;

use util::init;

#[test]
fn tasks_run_fifo_at_same_priority() -> Result<()> {
    init();
    let wm = WorkerPool::new(1)?;
    let order = Arc::new(Mutex::new(Vec::new()));
    // Worker 0 is the alarm worker; 1 is the general worker.
    let target = WorkerId(1);
    for i in 0..100 {
        let order = Arc::clone(&order);
        wm.run_in(
            target,
            from_here!(),
            Task::oneshot(move || order.lock().unwrap().push(i)),
            Priority::Med,
        );
    }
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    wm.run_in(
        target,
        from_here!(),
        Task::oneshot(move || done_tx.send(()).unwrap()),
        Priority::Med,
    );
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let got = order.lock().unwrap().clone();
    assert_eq!(got, (0..100).collect::<Vec<_>>());
    wm.join();
    Ok(())
}

#[test]
fn higher_priority_empties_first() -> Result<()> {
    init();
    let wm = WorkerPool::new(1)?;
    let target = WorkerId(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    // Park the worker so the queues fill while it is busy.
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    wm.run_in(
        target,
        from_here!(),
        Task::oneshot(move || {
            gate_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }),
        Priority::Med,
    );
    std::thread::sleep(Duration::from_millis(50));
    for (label, priority) in
        [("low", Priority::Low), ("high", Priority::High), ("med", Priority::Med)]
    {
        let order = Arc::clone(&order);
        wm.run_in(
            target,
            from_here!(),
            Task::oneshot(move || order.lock().unwrap().push(label)),
            priority,
        );
    }
    gate_tx.send(()).unwrap();

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    wm.run_in(
        target,
        from_here!(),
        Task::oneshot(move || done_tx.send(()).unwrap()),
        Priority::Low,
    );
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["high", "med", "low"]);
    wm.join();
    Ok(())
}

#[test]
fn delayed_task_fires_after_delay() -> Result<()> {
    init();
    let wm = WorkerPool::new(1)?;
    let (tx, rx) = std::sync::mpsc::channel();
    let started = Instant::now();
    wm.run_after(
        from_here!(),
        Duration::from_millis(100),
        Task::oneshot(move || tx.send(Instant::now()).unwrap()),
    );
    let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(fired_at.duration_since(started) >= Duration::from_millis(100));
    wm.join();
    Ok(())
}

#[test]
fn canceled_delayed_task_never_fires() -> Result<()> {
    init();
    let wm = WorkerPool::new(1)?;
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    let handle = wm.run_after(
        from_here!(),
        Duration::from_millis(100),
        Task::oneshot(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }),
    );
    handle.cancel();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    wm.join();
    Ok(())
}

#[test]
fn periodic_fires_until_unregistered() -> Result<()> {
    init();
    let wm = WorkerPool::new(1)?;
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let id = wm.register_periodic(
        from_here!(),
        Duration::from_millis(20),
        PermanentTask::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) < 3 {
        assert!(Instant::now() < deadline, "periodic task never fired");
        std::thread::sleep(Duration::from_millis(10));
    }
    // Unregistration blocks until the task body is out of every queue;
    // afterwards the count must stop moving.
    wm.unregister_periodic(id);
    let frozen = count.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), frozen);
    wm.join();
    Ok(())
}

#[test]
fn descriptor_readable_callback_fires() -> Result<()> {
    init();
    let wm = WorkerPool::new(1)?;
    let (a, b) = socketpair()?;
    a.set_nonblocking()?;

    let got = Arc::new(Mutex::new(Vec::new()));
    let got2 = Arc::clone(&got);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let wm2 = Arc::clone(&wm);
    // Descriptor registration and arming must happen on the owning thread.
    wm.run(
        from_here!(),
        Task::oneshot(move || {
            let d = wm2.register_socket(a, Priority::Med);
            let d2 = Arc::clone(&d);
            let got = Arc::clone(&got2);
            let ready_tx = ready_tx.clone();
            d.notify_when_readable(PermanentTask::new(move || {
                let mut buf = [0u8; 64];
                match d2.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        got.lock().unwrap().extend_from_slice(&buf[..n]);
                        ready_tx.send(()).unwrap();
                    }
                    _ => {}
                }
            }));
        }),
        Priority::Med,
    );
    std::thread::sleep(Duration::from_millis(50));
    b.write(b"wake")?;
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got.lock().unwrap().as_slice(), b"wake");
    wm.join();
    Ok(())
}

#[test]
fn descriptor_timeout_fires_when_idle() -> Result<()> {
    init();
    let wm = WorkerPool::new(1)?;
    let (a, _b) = socketpair()?;
    a.set_nonblocking()?;

    let (timeout_tx, timeout_rx) = std::sync::mpsc::channel();
    let wm2 = Arc::clone(&wm);
    wm.run(
        from_here!(),
        Task::oneshot(move || {
            let d = wm2.register_socket(a, Priority::Med);
            // A read interest must be active for the idle timer to apply.
            d.notify_when_readable(PermanentTask::new(|| {}));
            d.notify_when_timedout(
                Duration::from_millis(50),
                Task::oneshot(move || timeout_tx.send(Instant::now()).unwrap()),
            );
        }),
        Priority::Med,
    );
    let started = Instant::now();
    let fired = timeout_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(fired.duration_since(started) >= Duration::from_millis(50));
    wm.join();
    Ok(())
}

#[test]
fn load_counts_queued_work() -> Result<()> {
    init();
    let wm = WorkerPool::new(2)?;
    assert_eq!(wm.num_workers(), 3); // alarm + 2 general
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    wm.run_in(
        WorkerId(1),
        from_here!(),
        Task::oneshot(move || {
            gate_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }),
        Priority::Med,
    );
    std::thread::sleep(Duration::from_millis(50));
    // The pool routes new work away from the busy worker.
    let ran_on = Arc::new(Mutex::new(None));
    let r = Arc::clone(&ran_on);
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    wm.run(
        from_here!(),
        Task::oneshot(move || {
            *r.lock().unwrap() =
                remcc::worker::WorkerThread::current().map(|w| w.id());
            done_tx.send(()).unwrap();
        }),
        Priority::Med,
    );
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*ran_on.lock().unwrap(), Some(WorkerId(2)));
    gate_tx.send(()).unwrap();
    wm.join();
    Ok(())
}
