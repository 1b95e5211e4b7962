//! The helper side of the subprocess controller.
//!
//! Runs single-threaded (so it needs no internal locking) in a forked copy
//! of the process, or in a dedicated thread for tests. It owns every spawn:
//! admission control enforces `max_subprocs`, a separate cap for
//! low-priority runs, and one for heavy-weight runs. Quotas are
//! re-evaluated each time a process exits.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{info, trace, warn};

use super::{
    encode_message, Op, RecordReader, SubProcessKill, SubProcessOptions,
    SubProcessPriority, SubProcessReq, SubProcessRun, SubProcessSetOption,
    SubProcessStarted, SubProcessState, SubProcessTerminated, SubProcessWeight,
    TerminatedError,
};
use crate::io::{is_retryable, ScopedSocket};
use crate::net::socketpair;

const POLL_TICK: Duration = Duration::from_millis(100);

struct SubProc {
    req: SubProcessReq,
    state: SubProcessState,
    child: Option<Child>,
    kill_requested: bool,
}

pub struct SubProcessServer {
    sock: ScopedSocket,
    options: SubProcessOptions,
    subprocs: HashMap<i32, SubProc>,
    reader: RecordReader,
    pending_write: Vec<u8>,
    quit: bool,
}

impl SubProcessServer {
    pub fn new(sock: ScopedSocket, options: SubProcessOptions) -> SubProcessServer {
        SubProcessServer {
            sock,
            options,
            subprocs: HashMap::new(),
            reader: RecordReader::default(),
            pending_write: Vec::new(),
            quit: false,
        }
    }

    /// Serves until `SHUTDOWN` or peer EOF.
    pub fn run(mut self) {
        info!("subprocess controller server started");
        while !self.quit {
            let readable = self.poll_once();
            if readable {
                if !self.read_records() {
                    // Peer is gone; stop accepting and wind down.
                    self.quit = true;
                }
            }
            self.flush_writes();
            self.reap_children();
            self.try_spawn_pending();
        }
        if !self.options.dont_kill_subprocess {
            self.kill_all();
            // Give children a moment to exit so their records flush.
            for _ in 0..10 {
                self.reap_children();
                if self.subprocs.values().all(|p| p.child.is_none()) {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
        self.flush_writes();
        info!("subprocess controller server finished");
    }

    /// Waits for socket readiness or the reaping tick. Returns whether the
    /// socket is readable.
    fn poll_once(&mut self) -> bool {
        let mut events = libc::POLLIN;
        if !self.pending_write.is_empty() {
            events |= libc::POLLOUT;
        }
        let mut fds = [libc::pollfd {
            fd: self.sock.get(),
            events,
            revents: 0,
        }];
        let r = unsafe {
            libc::poll(fds.as_mut_ptr(), 1, POLL_TICK.as_millis() as libc::c_int)
        };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!("poll failed: {}", err);
            }
            return false;
        }
        fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0
    }

    /// Reads everything available. Returns false on EOF or error.
    fn read_records(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match self.sock.read(&mut buf) {
                Ok(0) => {
                    info!("controller client closed the channel");
                    return false;
                }
                Ok(n) => self.reader.feed(&buf[..n]),
                Err(ref err) if is_retryable(err) => break,
                Err(err) => {
                    warn!("controller channel read failed: {}", err);
                    return false;
                }
            }
        }
        while let Some((op, payload)) = self.reader.next_record() {
            self.handle_record(op, &payload);
        }
        true
    }

    fn handle_record(&mut self, op: i32, payload: &[u8]) {
        match Op::from_i32(op) {
            Some(Op::Register) => match bincode::deserialize::<SubProcessReq>(payload) {
                Ok(req) => self.register(req),
                Err(err) => warn!("bad REGISTER payload: {}", err),
            },
            Some(Op::RequestRun) => match bincode::deserialize::<SubProcessRun>(payload)
            {
                Ok(run) => self.request_run(run.id),
                Err(err) => warn!("bad REQUEST_RUN payload: {}", err),
            },
            Some(Op::Kill) => match bincode::deserialize::<SubProcessKill>(payload) {
                Ok(kill) => self.kill(kill.id),
                Err(err) => warn!("bad KILL payload: {}", err),
            },
            Some(Op::SetOption) => {
                match bincode::deserialize::<SubProcessSetOption>(payload) {
                    Ok(option) => {
                        self.options.max_subprocs = option.max_subprocs;
                        self.options.max_subprocs_low_priority =
                            option.max_subprocs_low_priority;
                        self.options.max_subprocs_heavy_weight =
                            option.max_subprocs_heavy_weight;
                        info!("options updated: {:?}", self.options);
                    }
                    Err(err) => warn!("bad SET_OPTION payload: {}", err),
                }
            }
            Some(Op::Shutdown) => {
                info!("shutdown requested");
                self.quit = true;
            }
            Some(Op::Nop) => {}
            other => warn!("unexpected record op={} ({:?})", op, other),
        }
    }

    fn register(&mut self, req: SubProcessReq) {
        trace!("register id={} prog={}", req.id, req.prog);
        let id = req.id;
        let prev = self.subprocs.insert(
            id,
            SubProc {
                req,
                state: SubProcessState::Setup,
                child: None,
                kill_requested: false,
            },
        );
        if prev.is_some() {
            warn!("id {} registered twice", id);
        }
    }

    fn request_run(&mut self, id: i32) {
        if let Some(proc_) = self.subprocs.get_mut(&id) {
            if proc_.state == SubProcessState::Setup {
                proc_.state = SubProcessState::Pending;
            }
        } else {
            warn!("REQUEST_RUN for unknown id {}", id);
        }
    }

    fn kill(&mut self, id: i32) {
        let not_started = {
            let Some(proc_) = self.subprocs.get_mut(&id) else {
                warn!("KILL for unknown id {}", id);
                return;
            };
            match proc_.state {
                SubProcessState::Run => {
                    proc_.kill_requested = true;
                    proc_.state = SubProcessState::Signaled;
                    if let Some(child) = &proc_.child {
                        let pid = child.id() as libc::pid_t;
                        info!("kill id={} pid={}", id, pid);
                        unsafe { libc::kill(pid, libc::SIGTERM) };
                    }
                    None
                }
                SubProcessState::Setup | SubProcessState::Pending => {
                    // Ended before it could be spawned.
                    proc_.state = SubProcessState::Finished;
                    Some(proc_.req.detach)
                }
                SubProcessState::Signaled | SubProcessState::Finished => None,
            }
        };
        if let Some(detach) = not_started {
            self.subprocs.remove(&id);
            if !detach {
                self.send_terminated(id, -1, TerminatedError::NotStarted);
            }
        }
    }

    fn kill_all(&mut self) {
        let ids: Vec<i32> = self.subprocs.keys().copied().collect();
        for id in ids {
            self.kill(id);
        }
    }

    fn running_counts(&self) -> (usize, usize, usize) {
        let mut total = 0;
        let mut low = 0;
        let mut heavy = 0;
        for p in self.subprocs.values() {
            if matches!(p.state, SubProcessState::Run | SubProcessState::Signaled)
                && p.child.is_some()
            {
                total += 1;
                if p.req.priority == SubProcessPriority::Low {
                    low += 1;
                }
                if p.req.weight == SubProcessWeight::Heavy {
                    heavy += 1;
                }
            }
        }
        (total, low, heavy)
    }

    fn try_spawn_pending(&mut self) {
        loop {
            let (total, low, heavy) = self.running_counts();
            if total >= self.options.max_subprocs {
                return;
            }
            // Lowest id first keeps admission order deterministic.
            let mut candidate = None;
            let mut ids: Vec<i32> = self.subprocs.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                let p = &self.subprocs[&id];
                if p.state != SubProcessState::Pending {
                    continue;
                }
                if p.req.priority == SubProcessPriority::Low
                    && low >= self.options.max_subprocs_low_priority
                {
                    continue;
                }
                if p.req.weight == SubProcessWeight::Heavy
                    && heavy >= self.options.max_subprocs_heavy_weight
                {
                    continue;
                }
                candidate = Some(id);
                break;
            }
            let Some(id) = candidate else { return };
            self.spawn(id);
        }
    }

    fn spawn(&mut self, id: i32) {
        let req = self.subprocs.get(&id).unwrap().req.clone();
        match spawn_child(&req) {
            Ok(child) => {
                let pid = child.id() as i32;
                info!("spawned id={} pid={} prog={}", id, pid, req.prog);
                let proc_ = self.subprocs.get_mut(&id).unwrap();
                proc_.child = Some(child);
                proc_.state = SubProcessState::Run;
                if !req.detach {
                    self.send_started(id, pid);
                }
            }
            Err(err) => {
                warn!("spawn id={} prog={} failed: {}", id, req.prog, err);
                self.subprocs.remove(&id);
                if !req.detach {
                    self.send_terminated(id, -1, TerminatedError::Failed);
                }
            }
        }
    }

    fn reap_children(&mut self) {
        let mut finished = Vec::new();
        for (id, p) in self.subprocs.iter_mut() {
            let Some(child) = p.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = exit_status_code(status);
                    let error = if p.kill_requested {
                        TerminatedError::Killed
                    } else {
                        TerminatedError::None
                    };
                    finished.push((*id, code, error, p.req.detach));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("wait for id={} failed: {}", id, err);
                    finished.push((*id, -1, TerminatedError::Failed, p.req.detach));
                }
            }
        }
        for (id, code, error, detach) in finished {
            self.subprocs.remove(&id);
            if !detach {
                self.send_terminated(id, code, error);
            }
        }
    }

    fn send_started(&mut self, id: i32, pid: i32) {
        encode_message(
            Op::Started,
            &SubProcessStarted { id, pid },
            &mut self.pending_write,
        );
        self.flush_writes();
    }

    fn send_terminated(&mut self, id: i32, status: i32, error: TerminatedError) {
        encode_message(
            Op::Terminated,
            &SubProcessTerminated { id, status, error },
            &mut self.pending_write,
        );
        self.flush_writes();
    }

    fn flush_writes(&mut self) {
        while !self.pending_write.is_empty() {
            match self.sock.write(&self.pending_write) {
                Ok(n) => {
                    self.pending_write.drain(..n);
                }
                Err(ref err) if is_retryable(err) => return,
                Err(err) => {
                    warn!("controller channel write failed: {}", err);
                    self.pending_write.clear();
                    self.quit = true;
                    return;
                }
            }
        }
    }
}

fn exit_status_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(0),
    }
}

fn spawn_child(req: &SubProcessReq) -> io::Result<Child> {
    let mut cmd = Command::new(&req.prog);
    if !req.argv.is_empty() {
        cmd.args(&req.argv[1..]);
    }
    if !req.cwd.is_empty() {
        cmd.current_dir(&req.cwd);
    }
    cmd.env_clear();
    for kv in &req.envs {
        if let Some((k, v)) = kv.split_once('=') {
            cmd.env(k, v);
        }
    }
    cmd.stdin(match req.stdin_filename.as_str() {
        "" => Stdio::null(),
        path => Stdio::from(File::open(path)?),
    });
    cmd.stdout(match req.stdout_filename.as_str() {
        "" => Stdio::null(),
        path => Stdio::from(output_file(path)?),
    });
    cmd.stderr(match req.stderr_filename.as_str() {
        "" => Stdio::null(),
        path => Stdio::from(output_file(path)?),
    });
    cmd.spawn()
}

fn output_file(path: &str) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// Runs the server in a dedicated thread over a socket pair; returns the
/// client end. This is the arrangement used by tests (and the shape the
/// original design used where fork was unavailable).
pub fn spawn_in_thread(
    options: SubProcessOptions,
) -> io::Result<(ScopedSocket, thread::JoinHandle<()>)> {
    let (client_end, server_end) = socketpair()?;
    client_end.set_nonblocking()?;
    server_end.set_nonblocking()?;
    let server = SubProcessServer::new(server_end, options);
    let handle = thread::Builder::new()
        .name("subproc-controller".to_string())
        .spawn(move || server.run())?;
    Ok((client_end, handle))
}

/// Forks the helper process. Must be called before any worker threads
/// exist. Returns the client end and the helper pid.
pub fn spawn_in_process(
    options: SubProcessOptions,
) -> io::Result<(ScopedSocket, libc::pid_t)> {
    let (client_end, mut server_end) = socketpair()?;
    client_end.set_nonblocking()?;
    server_end.set_nonblocking()?;
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        // Helper process: serve until the parent goes away, then exit with
        // no cleanup of parent state.
        drop(client_end);
        let server = SubProcessServer::new(server_end, options);
        server.run();
        unsafe { libc::_exit(0) };
    }
    server_end.close();
    Ok((client_end, pid))
}
