use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use remcc::subprocess::{
    client::{start_with_thread_server, SubProcess},
    SubProcessOptions, SubProcessPriority, SubProcessReq, SubProcessSetOption,
    SubProcessWeight, TerminatedError,
};
use remcc::task::Task;
use remcc::worker::WorkerPool;

mod util;

use util::init;

fn shell_req(trace: &str, script: &str) -> SubProcessReq {
    SubProcessReq {
        trace_id: trace.to_string(),
        prog: "/bin/sh".to_string(),
        argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        envs: vec!["PATH=/usr/bin:/bin".to_string()],
        cwd: "/tmp".to_string(),
        priority: SubProcessPriority::High,
        weight: SubProcessWeight::Normal,
        ..Default::default()
    }
}

#[test]
fn run_reports_exit_status() {
    init();
    let wm = WorkerPool::new(1).unwrap();
    let (client, server) =
        start_with_thread_server(Arc::clone(&wm), SubProcessOptions::default()).unwrap();

    let task = SubProcess::new(Arc::clone(&client), shell_req("exit7", "exit 7"));
    task.start(None);
    let terminated = task.wait();
    assert_eq!(terminated.status, 7);
    assert_eq!(terminated.error, TerminatedError::None);
    // STARTED must have arrived before TERMINATED.
    assert!(task.started().is_some());
    assert!(task.started().unwrap().pid > 0);

    client.shutdown();
    server.join().unwrap();
    wm.join();
}

#[test]
fn started_and_terminated_delivered_exactly_once() {
    init();
    let wm = WorkerPool::new(1).unwrap();
    let (client, server) =
        start_with_thread_server(Arc::clone(&wm), SubProcessOptions::default()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    let (done_tx, done_rx) = mpsc::channel();
    let task = SubProcess::new(Arc::clone(&client), shell_req("true", "true"));
    task.start(Some(Task::oneshot(move || {
        calls2.fetch_add(1, Ordering::SeqCst);
        done_tx.send(()).unwrap();
    })));
    let terminated = task.wait();
    assert_eq!(terminated.status, 0);
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.shutdown();
    server.join().unwrap();
    wm.join();
}

#[test]
fn admission_serializes_when_cap_is_one() {
    init();
    let wm = WorkerPool::new(1).unwrap();
    let options = SubProcessOptions {
        max_subprocs: 1,
        ..Default::default()
    };
    let (client, server) = start_with_thread_server(Arc::clone(&wm), options).unwrap();

    let started = Instant::now();
    let tasks: Vec<SubProcess> = (0..3)
        .map(|i| {
            let task = SubProcess::new(
                Arc::clone(&client),
                shell_req(&format!("sleep{}", i), "sleep 0.15"),
            );
            task.start(None);
            task
        })
        .collect();
    for task in &tasks {
        let terminated = task.wait();
        assert_eq!(terminated.status, 0);
    }
    // Three 150ms sleeps through a single slot cannot overlap.
    assert!(started.elapsed() >= Duration::from_millis(400));

    client.shutdown();
    server.join().unwrap();
    wm.join();
}

#[test]
fn kill_pending_reports_not_started() {
    init();
    let wm = WorkerPool::new(1).unwrap();
    let options = SubProcessOptions {
        max_subprocs: 1,
        ..Default::default()
    };
    let (client, server) = start_with_thread_server(Arc::clone(&wm), options).unwrap();

    // Occupy the only slot, then kill the queued run before it spawns.
    let runner = SubProcess::new(Arc::clone(&client), shell_req("hold", "sleep 0.5"));
    runner.start(None);
    let victim = SubProcess::new(Arc::clone(&client), shell_req("victim", "true"));
    victim.start(None);
    std::thread::sleep(Duration::from_millis(100));
    victim.kill();

    let terminated = victim.wait();
    assert_eq!(terminated.error, TerminatedError::NotStarted);
    let runner_term = runner.wait();
    assert_eq!(runner_term.status, 0);

    client.shutdown();
    server.join().unwrap();
    wm.join();
}

#[test]
fn kill_running_process() {
    init();
    let wm = WorkerPool::new(1).unwrap();
    let (client, server) =
        start_with_thread_server(Arc::clone(&wm), SubProcessOptions::default()).unwrap();

    let task = SubProcess::new(Arc::clone(&client), shell_req("long", "sleep 30"));
    task.start(None);
    // Wait for the spawn before signaling.
    let deadline = Instant::now() + Duration::from_secs(5);
    while task.started().is_none() {
        assert!(Instant::now() < deadline, "process never started");
        std::thread::sleep(Duration::from_millis(10));
    }
    task.kill();
    let terminated = task.wait();
    assert_eq!(terminated.error, TerminatedError::Killed);
    assert!(terminated.status < 0);

    client.shutdown();
    server.join().unwrap();
    wm.join();
}

#[test]
fn set_option_raises_caps() {
    init();
    let wm = WorkerPool::new(1).unwrap();
    let options = SubProcessOptions {
        max_subprocs: 1,
        ..Default::default()
    };
    let (client, server) = start_with_thread_server(Arc::clone(&wm), options).unwrap();

    client.set_option(SubProcessSetOption {
        max_subprocs: 4,
        max_subprocs_low_priority: 2,
        max_subprocs_heavy_weight: 2,
    });

    // With the raised cap, three sleeps overlap and finish fast.
    let started = Instant::now();
    let tasks: Vec<SubProcess> = (0..3)
        .map(|i| {
            let task = SubProcess::new(
                Arc::clone(&client),
                shell_req(&format!("par{}", i), "sleep 0.2"),
            );
            task.start(None);
            task
        })
        .collect();
    for task in &tasks {
        assert_eq!(task.wait().status, 0);
    }
    assert!(started.elapsed() < Duration::from_millis(550));

    client.shutdown();
    server.join().unwrap();
    wm.join();
}

#[test]
fn detached_run_gets_no_callback() {
    init();
    let wm = WorkerPool::new(1).unwrap();
    let (client, server) =
        start_with_thread_server(Arc::clone(&wm), SubProcessOptions::default()).unwrap();

    let mut req = shell_req("detached", "true");
    req.detach = true;
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    let task = SubProcess::new(Arc::clone(&client), req);
    task.start(Some(Task::oneshot(move || {
        calls2.fetch_add(1, Ordering::SeqCst);
    })));

    // A later tracked run completing proves the channel stayed healthy.
    let probe = SubProcess::new(Arc::clone(&client), shell_req("probe", "true"));
    probe.start(None);
    assert_eq!(probe.wait().status, 0);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.shutdown();
    server.join().unwrap();
    wm.join();
}

#[test]
fn wire_survives_arbitrary_payload_sizes() {
    init();
    // Exercise record reassembly with random argv blobs.
    use rand::Rng;
    let mut rng = rand::rng();
    let wm = WorkerPool::new(1).unwrap();
    let (client, server) =
        start_with_thread_server(Arc::clone(&wm), SubProcessOptions::default()).unwrap();

    let junk: String = (0..rng.random_range(2000..6000))
        .map(|_| rng.random_range(b'a'..=b'z') as char)
        .collect();
    let task = SubProcess::new(
        Arc::clone(&client),
        shell_req("big", &format!("test -n \"{}\"", junk)),
    );
    task.start(None);
    assert_eq!(task.wait().status, 0);

    client.shutdown();
    server.join().unwrap();
    wm.join();
}
