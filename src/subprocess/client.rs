//! The main-process side of the subprocess controller.
//!
//! The client serializes requests onto the controller channel from any
//! thread and reads `STARTED`/`TERMINATED` records on a dedicated worker
//! pool. A [`SubProcess`] handle tracks one registered run through the
//! `Setup -> Pending -> Run -> Finished` lifecycle; its callback fires at
//! most once, on the thread that started it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

use log::{error, info, trace, warn};

use super::{
    encode_message, encode_record, Op, RecordReader, SubProcessKill,
    SubProcessOptions, SubProcessPriority, SubProcessReq, SubProcessRun,
    SubProcessSetOption, SubProcessStarted, SubProcessState, SubProcessTerminated,
    SubProcessWeight, TerminatedError,
};
use crate::descriptor::{Descriptor, SocketDescriptor};
use crate::io::{is_retryable, ScopedSocket};
use crate::task::{PermanentTask, Task};
use crate::worker::{PoolId, Priority, WorkerPool, WorkerThread};

struct TaskEntry {
    state: SubProcessState,
    shared: Arc<SubProcessShared>,
    submitter: Option<Arc<WorkerThread>>,
    callback: Option<Task>,
}

struct ClientInner {
    sd: Option<Arc<SocketDescriptor>>,
    pending_write: Vec<u8>,
    reader: RecordReader,
    tasks: HashMap<i32, TaskEntry>,
    next_id: i32,
    closed: bool,
    shutting_down: bool,
}

pub struct SubProcessClient {
    wm: Arc<WorkerPool>,
    pool: PoolId,
    helper_pid: Option<libc::pid_t>,
    inner: Mutex<ClientInner>,
    cond: Condvar,
}

impl SubProcessClient {
    /// Wires the client to a controller channel. `helper_pid` is set when
    /// the server runs in a forked helper (it is reaped at shutdown).
    pub fn new(
        wm: Arc<WorkerPool>,
        sock: ScopedSocket,
        helper_pid: Option<libc::pid_t>,
    ) -> io::Result<Arc<SubProcessClient>> {
        let pool = wm.start_pool("subproc", 1)?;
        let client = Arc::new(SubProcessClient {
            wm,
            pool,
            helper_pid,
            inner: Mutex::new(ClientInner {
                sd: None,
                pending_write: Vec::new(),
                reader: RecordReader::default(),
                tasks: HashMap::new(),
                next_id: 1,
                closed: false,
                shutting_down: false,
            }),
            cond: Condvar::new(),
        });
        let me = Arc::clone(&client);
        client.wm.run_in_pool(
            client.pool,
            crate::from_here!(),
            Task::oneshot(move || me.setup(sock)),
            Priority::High,
        );
        Ok(client)
    }

    /// Runs on the dedicated worker: registers the channel descriptor.
    fn setup(self: Arc<Self>, sock: ScopedSocket) {
        let worker = WorkerThread::current().expect("setup must run on a worker");
        let sd = worker.register_socket(sock, Priority::High);
        let me = Arc::clone(&self);
        sd.notify_when_readable(PermanentTask::new(move || me.do_read()));
        let me = Arc::clone(&self);
        sd.notify_when_writable(PermanentTask::new(move || me.do_write()));
        sd.stop_write();
        sd.unregister_writable();
        let flush = {
            let mut inner = self.inner.lock().unwrap();
            inner.sd = Some(Arc::clone(&sd));
            // Records queued before the channel descriptor existed are
            // still waiting.
            !inner.pending_write.is_empty()
        };
        if flush {
            sd.restart_write();
        }
    }

    fn send_record(&self, bytes: Vec<u8>) {
        let sd = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                warn!("record dropped: controller channel is closed");
                return;
            }
            inner.pending_write.extend_from_slice(&bytes);
            inner.sd.clone()
        };
        if let Some(sd) = sd {
            // Arm the write side from its owning thread.
            let worker = Arc::clone(sd.worker());
            worker.run_task(
                crate::from_here!(),
                Task::oneshot(move || sd.restart_write()),
                Priority::High,
            );
        }
    }

    fn do_write(self: &Arc<Self>) {
        let sd = {
            let inner = self.inner.lock().unwrap();
            match &inner.sd {
                Some(sd) => Arc::clone(sd),
                None => return,
            }
        };
        loop {
            let chunk = {
                let inner = self.inner.lock().unwrap();
                if inner.pending_write.is_empty() {
                    break;
                }
                inner.pending_write.clone()
            };
            match sd.write(&chunk) {
                Ok(n) => {
                    self.inner.lock().unwrap().pending_write.drain(..n);
                }
                Err(ref err) if is_retryable(err) => return,
                Err(err) => {
                    error!("controller channel write failed: {}", err);
                    self.handle_closed();
                    return;
                }
            }
        }
        sd.stop_write();
        sd.unregister_writable();
    }

    fn do_read(self: &Arc<Self>) {
        let sd = {
            let inner = self.inner.lock().unwrap();
            match &inner.sd {
                Some(sd) => Arc::clone(sd),
                None => return,
            }
        };
        let mut buf = [0u8; 4096];
        loop {
            match sd.read(&mut buf) {
                Ok(0) => {
                    self.handle_closed();
                    return;
                }
                Ok(n) => {
                    self.inner.lock().unwrap().reader.feed(&buf[..n]);
                }
                Err(ref err) if is_retryable(err) => break,
                Err(err) => {
                    error!("controller channel read failed: {}", err);
                    self.handle_closed();
                    return;
                }
            }
        }
        loop {
            let record = self.inner.lock().unwrap().reader.next_record();
            let Some((op, payload)) = record else { break };
            self.handle_record(op, &payload);
        }
    }

    fn handle_record(self: &Arc<Self>, op: i32, payload: &[u8]) {
        match Op::from_i32(op) {
            Some(Op::Started) => {
                match bincode::deserialize::<SubProcessStarted>(payload) {
                    Ok(started) => self.handle_started(started),
                    Err(err) => warn!("bad STARTED payload: {}", err),
                }
            }
            Some(Op::Terminated) => {
                match bincode::deserialize::<SubProcessTerminated>(payload) {
                    Ok(terminated) => self.handle_terminated(terminated),
                    Err(err) => warn!("bad TERMINATED payload: {}", err),
                }
            }
            other => warn!("unexpected record from server: op={} {:?}", op, other),
        }
    }

    fn handle_started(&self, started: SubProcessStarted) {
        trace!("started id={} pid={}", started.id, started.pid);
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.tasks.get_mut(&started.id) {
            entry.state = SubProcessState::Run;
            entry.shared.set_started(started);
        } else {
            warn!("STARTED for unknown id {}", started.id);
        }
    }

    fn handle_terminated(&self, terminated: SubProcessTerminated) {
        trace!(
            "terminated id={} status={} error={:?}",
            terminated.id,
            terminated.status,
            terminated.error
        );
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            inner.tasks.remove(&terminated.id)
        };
        let Some(mut entry) = entry else {
            warn!("TERMINATED for unknown id {}", terminated.id);
            return;
        };
        entry.state = SubProcessState::Finished;
        entry.shared.set_terminated(terminated);
        if let Some(callback) = entry.callback.take() {
            match &entry.submitter {
                Some(worker) => {
                    worker.run_task(crate::from_here!(), callback, Priority::Med)
                }
                None => self.wm.run(crate::from_here!(), callback, Priority::Med),
            }
        }
        self.cond.notify_all();
    }

    /// Peer EOF. Outside shutdown this means the helper died: reap it and
    /// fail every outstanding task.
    fn handle_closed(self: &Arc<Self>) {
        let (expected, tasks) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let tasks: Vec<TaskEntry> =
                inner.tasks.drain().map(|(_, entry)| entry).collect();
            (inner.shutting_down, tasks)
        };
        if !expected {
            error!("subprocess controller channel closed unexpectedly");
        }
        if let Some(pid) = self.helper_pid {
            let mut status: libc::c_int = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };
            info!("helper pid={} exited with status {}", pid, status);
        }
        for mut entry in tasks {
            entry.shared.set_terminated(SubProcessTerminated {
                id: -1,
                status: -1,
                error: TerminatedError::NotStarted,
            });
            if let Some(callback) = entry.callback.take() {
                match &entry.submitter {
                    Some(worker) => {
                        worker.run_task(crate::from_here!(), callback, Priority::Med)
                    }
                    None => self.wm.run(crate::from_here!(), callback, Priority::Med),
                }
            }
        }
        self.cond.notify_all();
    }

    fn register(
        &self,
        mut req: SubProcessReq,
        shared: Arc<SubProcessShared>,
        callback: Option<Task>,
    ) -> i32 {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            req.id = id;
            // Detached runs are fire-and-forget: no TERMINATED will come
            // back, so nothing to track.
            if !req.detach {
                inner.tasks.insert(
                    id,
                    TaskEntry {
                        state: SubProcessState::Pending,
                        shared,
                        submitter: WorkerThread::current(),
                        callback,
                    },
                );
            }
            id
        };
        let mut wire = Vec::new();
        encode_message(Op::Register, &req, &mut wire);
        encode_message(Op::RequestRun, &SubProcessRun { id }, &mut wire);
        self.send_record(wire);
        id
    }

    fn kill(&self, id: i32) {
        let mut wire = Vec::new();
        encode_message(Op::Kill, &SubProcessKill { id }, &mut wire);
        self.send_record(wire);
    }

    pub fn set_option(&self, option: SubProcessSetOption) {
        let mut wire = Vec::new();
        encode_message(Op::SetOption, &option, &mut wire);
        self.send_record(wire);
    }

    pub fn num_pending(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.state == SubProcessState::Pending)
            .count()
    }

    pub fn num_running(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.state == SubProcessState::Run)
            .count()
    }

    /// Sends `SHUTDOWN` and blocks until the reader observes the channel
    /// close.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.shutting_down = true;
        }
        let mut wire = Vec::new();
        encode_record(Op::Shutdown, b"", &mut wire);
        self.send_record(wire);
        let mut inner = self.inner.lock().unwrap();
        while !inner.closed {
            inner = self.cond.wait(inner).unwrap();
        }
    }
}

#[derive(Default)]
struct SubProcessResult {
    started: Option<SubProcessStarted>,
    terminated: Option<SubProcessTerminated>,
}

struct SubProcessShared {
    result: Mutex<SubProcessResult>,
    cond: Condvar,
}

impl SubProcessShared {
    fn set_started(&self, started: SubProcessStarted) {
        let mut r = self.result.lock().unwrap();
        debug_assert!(r.started.is_none(), "STARTED delivered twice");
        r.started = Some(started);
        drop(r);
        self.cond.notify_all();
    }

    fn set_terminated(&self, terminated: SubProcessTerminated) {
        let mut r = self.result.lock().unwrap();
        debug_assert!(r.terminated.is_none(), "TERMINATED delivered twice");
        r.terminated = Some(terminated);
        drop(r);
        self.cond.notify_all();
    }
}

/// One requested run.
pub struct SubProcess {
    client: Arc<SubProcessClient>,
    req: Mutex<Option<SubProcessReq>>,
    id: Mutex<Option<i32>>,
    shared: Arc<SubProcessShared>,
}

impl SubProcess {
    pub fn new(client: Arc<SubProcessClient>, req: SubProcessReq) -> SubProcess {
        SubProcess {
            client,
            req: Mutex::new(Some(req)),
            id: Mutex::new(None),
            shared: Arc::new(SubProcessShared {
                result: Mutex::new(SubProcessResult::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Registers and requests the run. `callback` fires once the process
    /// terminates (never for detached runs).
    pub fn start(&self, callback: Option<Task>) {
        let req = self
            .req
            .lock()
            .unwrap()
            .take()
            .expect("subprocess started twice");
        let id = self
            .client
            .register(req, Arc::clone(&self.shared), callback);
        *self.id.lock().unwrap() = Some(id);
    }

    pub fn kill(&self) {
        if let Some(id) = *self.id.lock().unwrap() {
            self.client.kill(id);
        }
    }

    pub fn started(&self) -> Option<SubProcessStarted> {
        self.shared.result.lock().unwrap().started.clone()
    }

    /// Blocks until the terminated record arrives.
    pub fn wait(&self) -> SubProcessTerminated {
        let mut r = self.shared.result.lock().unwrap();
        while r.terminated.is_none() {
            r = self.shared.cond.wait(r).unwrap();
        }
        r.terminated.clone().unwrap()
    }
}

/// Builder-style convenience for local compiler fallback runs.
pub fn local_run_request(
    prog: &str,
    argv: &[String],
    envs: &[String],
    cwd: &str,
    priority: SubProcessPriority,
    weight: SubProcessWeight,
) -> SubProcessReq {
    SubProcessReq {
        id: 0,
        trace_id: format!("local:{}", prog),
        prog: prog.to_string(),
        argv: argv.to_vec(),
        envs: envs.to_vec(),
        cwd: cwd.to_string(),
        stdin_filename: String::new(),
        stdout_filename: String::new(),
        stderr_filename: String::new(),
        priority,
        weight,
        detach: false,
    }
}

/// Convenience: spawn the in-thread server and a client over it (used by
/// tests and by platforms without fork).
pub fn start_with_thread_server(
    wm: Arc<WorkerPool>,
    options: SubProcessOptions,
) -> io::Result<(Arc<SubProcessClient>, std::thread::JoinHandle<()>)> {
    let (sock, handle) = super::server::spawn_in_thread(options)?;
    let client = SubProcessClient::new(wm, sock, None)?;
    Ok((client, handle))
}
