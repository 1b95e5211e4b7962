//! Per-call RPC state machine.
//!
//! An [`HttpCall`] drives one logical `POST` through descriptor events:
//! connect (via the socket factory, optionally wrapped in TLS), send,
//! read the head, then read the body under one of the three legal framing
//! modes — `Content-Length`, chunked, or close-delimited. Connect failures,
//! timeouts, and 5xx responses retry with exponential backoff up to the
//! configured cap; 4xx and a 200 with a bad envelope do not.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{info, trace, warn};

use super::{
    gzip_compress, gzip_decompress, parse_response_head, HttpClient, ResponseHead,
    USER_AGENT,
};
use crate::descriptor::{Descriptor, SocketDescriptor};
use crate::error::ErrorCode;
use crate::io::is_retryable;
use crate::task::{PermanentTask, Task};
use crate::worker::{Priority, WorkerThread};

/// Outcome and timing breakdown of one RPC, shared between the caller and
/// the state machine through a [`StatusRef`].
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub connect_success: bool,
    pub finished: bool,
    pub err: ErrorCode,
    pub err_message: String,
    pub http_return_code: i32,
    pub req_size: usize,
    pub resp_size: usize,
    pub raw_req_size: usize,
    pub raw_resp_size: usize,
    pub req_build_time: Duration,
    pub req_send_time: Duration,
    pub wait_time: Duration,
    pub resp_recv_time: Duration,
    pub resp_parse_time: Duration,
    pub pending_time: Duration,
    pub num_retry: usize,
    pub response_header: String,
    pub response_body: Vec<u8>,
    pub trace_id: String,
    /// Set on batched calls to the trace id of the combined call.
    pub master_trace_id: String,
    /// Per-call read timeout override; zero uses the client default.
    pub timeout: Duration,
}

struct StatusCell {
    status: Mutex<Status>,
    cond: Condvar,
}

/// Cloneable handle to a [`Status`].
#[derive(Clone)]
pub struct StatusRef {
    cell: Arc<StatusCell>,
}

impl StatusRef {
    pub fn new() -> StatusRef {
        StatusRef {
            cell: Arc::new(StatusCell {
                status: Mutex::new(Status::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Status) -> R) -> R {
        f(&mut self.cell.status.lock().unwrap())
    }

    pub fn snapshot(&self) -> Status {
        self.cell.status.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.cell.status.lock().unwrap().finished
    }

    /// Marks the status finished and wakes synchronous waiters.
    pub fn set_finished(&self) {
        let mut st = self.cell.status.lock().unwrap();
        debug_assert!(!st.finished, "status finished twice");
        st.finished = true;
        drop(st);
        self.cell.cond.notify_all();
    }

    pub fn wait_finished(&self) {
        let mut st = self.cell.status.lock().unwrap();
        while !st.finished {
            st = self.cell.cond.wait(st).unwrap();
        }
    }
}

impl Default for StatusRef {
    fn default() -> StatusRef {
        StatusRef::new()
    }
}

enum ChunkProgress {
    Complete(Vec<u8>),
    Incomplete { whole_chunks: usize },
    Malformed(String),
}

/// Decodes as much of a chunked body as has arrived.
fn parse_chunked(data: &[u8]) -> ChunkProgress {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut whole_chunks = 0;
    loop {
        let line_end = match data[pos..].windows(2).position(|w| w == b"\r\n") {
            Some(i) => pos + i,
            None => return ChunkProgress::Incomplete { whole_chunks },
        };
        let size_text = match std::str::from_utf8(&data[pos..line_end]) {
            Ok(s) => s.split(';').next().unwrap_or("").trim(),
            Err(_) => return ChunkProgress::Malformed("non-utf8 chunk size".to_string()),
        };
        let size = match usize::from_str_radix(size_text, 16) {
            Ok(n) => n,
            Err(_) => {
                return ChunkProgress::Malformed(format!(
                    "bad chunk size {:?}",
                    size_text
                ))
            }
        };
        if size == 0 {
            return ChunkProgress::Complete(out);
        }
        let data_start = line_end + 2;
        let data_end = data_start + size;
        if data.len() < data_end + 2 {
            return ChunkProgress::Incomplete { whole_chunks };
        }
        out.extend_from_slice(&data[data_start..data_end]);
        if &data[data_end..data_end + 2] != b"\r\n" {
            return ChunkProgress::Malformed("chunk data not CRLF-terminated".to_string());
        }
        pos = data_end + 2;
        whole_chunks += 1;
    }
}

struct CallState {
    desc: Option<Arc<dyn Descriptor>>,
    sock_desc: Option<Arc<SocketDescriptor>>,
    send_buf: Vec<u8>,
    send_offset: usize,
    resp_buf: Vec<u8>,
    head: Option<ResponseHead>,
    seen_eof: bool,
    retries: usize,
    started: Instant,
    send_done_at: Option<Instant>,
    done: bool,
}

/// One in-flight call. Kept alive by the descriptor callbacks until a
/// terminal transition clears them.
pub(crate) struct HttpCall {
    client: Arc<HttpClient>,
    path: String,
    body: Vec<u8>,
    status: StatusRef,
    submitter: Option<Arc<WorkerThread>>,
    callback: Mutex<Option<Task>>,
    state: Mutex<CallState>,
}

impl HttpCall {
    pub(crate) fn start(
        client: &Arc<HttpClient>,
        path: &str,
        req: Vec<u8>,
        status: StatusRef,
        callback: Option<Task>,
    ) {
        client.record_query_start();
        let build_start = Instant::now();
        let body = if client.options().start_compression && !req.is_empty() {
            gzip_compress(&req)
        } else {
            req.clone()
        };
        status.with(|s| {
            s.req_build_time = build_start.elapsed();
            s.raw_req_size = req.len();
            s.req_size = body.len();
        });
        let call = Arc::new(HttpCall {
            client: Arc::clone(client),
            path: path.to_string(),
            body,
            status,
            submitter: WorkerThread::current(),
            callback: Mutex::new(callback),
            state: Mutex::new(CallState {
                desc: None,
                sock_desc: None,
                send_buf: Vec::new(),
                send_offset: 0,
                resp_buf: Vec::new(),
                head: None,
                seen_eof: false,
                retries: 0,
                started: Instant::now(),
                send_done_at: None,
                done: false,
            }),
        });
        match &call.submitter {
            Some(worker) => {
                let c = Arc::clone(&call);
                worker.run_task(
                    crate::from_here!(),
                    Task::oneshot(move || c.start_attempt()),
                    Priority::Med,
                );
            }
            None => {
                let c = Arc::clone(&call);
                call.client.wm().run(
                    crate::from_here!(),
                    Task::oneshot(move || c.start_attempt()),
                    Priority::Med,
                );
            }
        }
    }

    fn read_timeout(&self) -> Duration {
        let t = self.status.with(|s| s.timeout);
        if t.is_zero() {
            self.client.options().socket_read_timeout
        } else {
            t
        }
    }

    fn build_request(&self) -> Vec<u8> {
        let options = self.client.options();
        let mut head = format!(
            "POST {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
            options.request_target(&self.path),
            options.dest_host_name,
            options.dest_port,
            USER_AGENT,
            options.content_type_for_protobuf,
            self.body.len()
        );
        if options.start_compression {
            head.push_str("Content-Encoding: gzip\r\nAccept-Encoding: gzip\r\n");
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    fn start_attempt(self: Arc<Self>) {
        if self.client.shutting_down() {
            self.status.with(|s| s.connect_success = false);
            self.finish(ErrorCode::Fail, "client is shutting down");
            return;
        }
        let (sock, reused) = match self.client.socket_factory().new_socket() {
            Ok(pair) => pair,
            Err(err) => {
                info!("connect to {} failed: {}", self.client.socket_factory().dest_name(), err);
                self.status.with(|s| s.connect_success = false);
                self.maybe_retry(ErrorCode::Fail, &format!("connect failed: {}", err));
                return;
            }
        };
        let worker =
            WorkerThread::current().expect("http call must start on a worker thread");
        let sd = worker.register_socket(sock, Priority::Med);
        let desc: Arc<dyn Descriptor> = if self.client.options().use_ssl {
            let factory = self
                .client
                .tls_factory()
                .expect("use_ssl requires a tls engine factory");
            let engine =
                match factory.new_engine(&self.client.options().dest_host_name) {
                    Ok(engine) => engine,
                    Err(err) => {
                        let sock = worker.delete_socket(&sd);
                        self.client.socket_factory().close_socket(sock, true);
                        self.status.with(|s| s.connect_success = false);
                        self.finish(ErrorCode::Fail, &format!("tls: {}", err));
                        return;
                    }
                };
            let tls = crate::tls::TlsDescriptor::new(
                Arc::clone(&sd),
                engine,
                self.client.options().tls_options(),
                reused,
            );
            tls.init();
            tls
        } else {
            Arc::clone(&sd) as Arc<dyn Descriptor>
        };

        {
            let mut st = self.state.lock().unwrap();
            st.send_buf = self.build_request();
            st.send_offset = 0;
            st.resp_buf.clear();
            st.head = None;
            st.seen_eof = false;
            st.send_done_at = None;
            st.desc = Some(Arc::clone(&desc));
            st.sock_desc = Some(sd);
        }
        self.status.with(|s| s.connect_success = true);

        let me = Arc::clone(&self);
        desc.notify_when_writable(PermanentTask::new(move || me.clone().do_write()));
        let me = Arc::clone(&self);
        desc.notify_when_timedout(
            self.read_timeout(),
            Task::oneshot(move || me.handle_timeout()),
        );
    }

    fn do_write(self: Arc<Self>) {
        let desc = {
            let st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            match &st.desc {
                Some(d) => Arc::clone(d),
                None => return,
            }
        };
        loop {
            let (offset, len) = {
                let st = self.state.lock().unwrap();
                (st.send_offset, st.send_buf.len())
            };
            if offset >= len {
                break;
            }
            let chunk = {
                let st = self.state.lock().unwrap();
                st.send_buf[offset..].to_vec()
            };
            match desc.write(&chunk) {
                Ok(n) => {
                    self.state.lock().unwrap().send_offset += n;
                }
                Err(ref err) if is_retryable(err) => return,
                Err(err) => {
                    warn!("send to {} failed: {}", self.path, err);
                    self.maybe_retry(
                        ErrorCode::Fail,
                        &format!("failed to send request: {}", err),
                    );
                    return;
                }
            }
        }
        // Whole request is out; switch to reading the response.
        self.state.lock().unwrap().send_done_at = Some(Instant::now());
        desc.clear_writable();
        let me = Arc::clone(&self);
        desc.notify_when_readable(PermanentTask::new(move || me.clone().do_read()));
    }

    fn do_read(self: Arc<Self>) {
        let desc = {
            let st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            match &st.desc {
                Some(d) => Arc::clone(d),
                None => return,
            }
        };
        let mut buf = [0u8; 4096];
        loop {
            match desc.read(&mut buf) {
                Ok(0) => {
                    self.state.lock().unwrap().seen_eof = true;
                    break;
                }
                Ok(n) => {
                    self.state.lock().unwrap().resp_buf.extend_from_slice(&buf[..n]);
                }
                Err(ref err) if is_retryable(err) => break,
                Err(err) => {
                    warn!("read from {} failed: {}", self.path, err);
                    self.maybe_retry(
                        ErrorCode::Fail,
                        &format!("failed to read response: {}", err),
                    );
                    return;
                }
            }
        }
        self.try_complete();
    }

    fn try_complete(self: Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        if st.done {
            return;
        }
        if st.head.is_none() {
            match parse_response_head(&st.resp_buf) {
                Some(head) => st.head = Some(head),
                None => {
                    if st.seen_eof {
                        drop(st);
                        self.maybe_retry(
                            ErrorCode::Fail,
                            "connection closed before response header",
                        );
                    }
                    return;
                }
            }
        }
        let head = st.head.as_ref().unwrap();
        let head_len = head.head_len;
        let body_bytes = &st.resp_buf[head_len.min(st.resp_buf.len())..];

        if let Some(len_text) = head.header("Content-Length") {
            let want: usize = match len_text.parse() {
                Ok(n) => n,
                Err(_) => {
                    drop(st);
                    self.finish(ErrorCode::Fail, "malformed Content-Length");
                    return;
                }
            };
            if body_bytes.len() >= want {
                let body = body_bytes[..want].to_vec();
                drop(st);
                self.process_response(body);
            } else if st.seen_eof {
                let msg = format!(
                    "short read: {} of {} body bytes",
                    body_bytes.len(),
                    want
                );
                drop(st);
                self.finish(ErrorCode::Fail, &msg);
            }
            return;
        }

        if head
            .header("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            match parse_chunked(body_bytes) {
                ChunkProgress::Complete(body) => {
                    drop(st);
                    self.process_response(body);
                }
                ChunkProgress::Incomplete { whole_chunks } => {
                    if st.seen_eof {
                        let msg = if whole_chunks > 0 {
                            "connection closed before the last chunk".to_string()
                        } else {
                            "connection closed mid-chunk".to_string()
                        };
                        drop(st);
                        self.finish(ErrorCode::Fail, &msg);
                    }
                }
                ChunkProgress::Malformed(msg) => {
                    drop(st);
                    self.finish(ErrorCode::Fail, &msg);
                }
            }
            return;
        }

        // Close-delimited: success on server close, empty bodies tolerated.
        if st.seen_eof {
            let body = body_bytes.to_vec();
            drop(st);
            self.process_response(body);
        }
    }

    fn process_response(self: Arc<Self>, body: Vec<u8>) {
        let recv_done = Instant::now();
        let (code, header_raw, gzipped, connection_close) = {
            let st = self.state.lock().unwrap();
            let head = st.head.as_ref().unwrap();
            (
                head.code,
                head.raw.clone(),
                head.header("Content-Encoding")
                    .map(|v| v.contains("gzip"))
                    .unwrap_or(false),
                head.header("Connection")
                    .map(|v| v.eq_ignore_ascii_case("close"))
                    .unwrap_or(false),
            )
        };
        let raw_resp_size = body.len();
        let parse_start = Instant::now();
        let body = if gzipped {
            match gzip_decompress(&body) {
                Ok(b) => b,
                Err(err) => {
                    self.finish(
                        ErrorCode::Fail,
                        &format!("failed to decompress response: {}", err),
                    );
                    return;
                }
            }
        } else {
            body
        };
        self.status.with(|s| {
            s.http_return_code = code;
            s.response_header = header_raw;
            s.raw_resp_size = raw_resp_size;
            s.resp_size = body.len();
            s.response_body = body;
            s.resp_parse_time = parse_start.elapsed();
            if let Some(send_done) = self.state.lock().unwrap().send_done_at {
                s.wait_time = recv_done.saturating_duration_since(send_done);
            }
        });
        if !connection_close {
            trace!("keep-alive candidate for {}", self.path);
        }
        match code {
            200..=299 => self.finish(ErrorCode::Ok, ""),
            400..=499 => {
                // Rejected by the server; retrying would not help.
                self.finish(ErrorCode::Fail, &format!("http status {}", code))
            }
            _ => self.maybe_retry(ErrorCode::Fail, &format!("http status {}", code)),
        }
    }

    fn handle_timeout(self: Arc<Self>) {
        info!("rpc timed out: {}", self.path);
        self.maybe_retry(ErrorCode::Timeout, "socket timeout");
    }

    /// Tears down the connection and either schedules another attempt with
    /// exponential backoff or gives up with `err`.
    fn maybe_retry(self: &Arc<Self>, err: ErrorCode, msg: &str) {
        self.cleanup_descriptor(true);
        let retries = {
            let mut st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            st.retries += 1;
            st.retries
        };
        self.status.with(|s| s.num_retry = retries);
        if retries > self.client.options().num_retry_max || self.client.shutting_down()
        {
            self.finish(err, msg);
            return;
        }
        let options = self.client.options();
        let backoff = options
            .min_retry_backoff
            .saturating_mul(1 << (retries - 1).min(16) as u32)
            .min(options.max_retry_backoff);
        info!(
            "retry {} of {} for {} in {:?}: {}",
            retries, options.num_retry_max, self.path, backoff, msg
        );
        let me = Arc::clone(self);
        self.client.wm().run_after(
            crate::from_here!(),
            backoff,
            Task::oneshot(move || me.start_attempt()),
        );
    }

    /// Clears callbacks, detaches the socket, and returns it to the factory
    /// (kept alive on clean close, discarded on error).
    fn cleanup_descriptor(&self, err: bool) {
        let (desc, sd, connection_close) = {
            let mut st = self.state.lock().unwrap();
            let close = st
                .head
                .as_ref()
                .and_then(|h| h.header("Connection"))
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);
            (st.desc.take(), st.sock_desc.take(), close)
        };
        if let Some(desc) = &desc {
            desc.clear_readable();
            desc.clear_writable();
            desc.clear_timeout();
        }
        if let Some(sd) = sd {
            let sock = sd.worker().clone().delete_socket(&sd);
            let reusable = !err
                && !connection_close
                && desc.as_ref().map(|d| d.can_reuse()).unwrap_or(false);
            if reusable {
                self.client.socket_factory().release_socket(sock);
            } else {
                self.client.socket_factory().close_socket(sock, err);
            }
        }
    }

    fn finish(self: &Arc<Self>, err: ErrorCode, msg: &str) {
        {
            let mut st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            st.done = true;
        }
        self.cleanup_descriptor(err != ErrorCode::Ok);
        let (retries, started, send_done_at) = {
            let st = self.state.lock().unwrap();
            (st.retries, st.started, st.send_done_at)
        };
        self.status.with(|s| {
            s.err = err;
            s.err_message = msg.to_string();
            s.num_retry = retries;
            if let Some(send_done) = send_done_at {
                s.req_send_time = send_done.saturating_duration_since(started);
                s.resp_recv_time = send_done.elapsed();
            }
        });
        self.client.record_query_finish(err, retries > 0);
        self.status.set_finished();
        if let Some(task) = self.callback.lock().unwrap().take() {
            match &self.submitter {
                Some(worker) => {
                    worker.run_task(crate::from_here!(), task, Priority::Med)
                }
                None => self
                    .client
                    .wm()
                    .run(crate::from_here!(), task, Priority::Med),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(format!("{:x}\r\n", p.len()).as_bytes());
            out.extend_from_slice(p.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn chunked_complete() {
        let mut data = chunked(&["hello ", "world"]);
        data.extend_from_slice(b"0\r\n\r\n");
        match parse_chunked(&data) {
            ChunkProgress::Complete(body) => assert_eq!(body, b"hello world"),
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn chunked_incomplete_counts_whole_chunks() {
        let mut data = chunked(&["hello "]);
        data.extend_from_slice(b"5\r\nwor");
        match parse_chunked(&data) {
            ChunkProgress::Incomplete { whole_chunks } => assert_eq!(whole_chunks, 1),
            _ => panic!("expected incomplete"),
        }
    }

    #[test]
    fn chunked_rejects_bad_size() {
        assert!(matches!(
            parse_chunked(b"zz\r\nhello\r\n"),
            ChunkProgress::Malformed(_)
        ));
    }

    #[test]
    fn chunked_rejects_missing_crlf() {
        assert!(matches!(
            parse_chunked(b"5\r\nhelloXX"),
            ChunkProgress::Malformed(_)
        ));
    }

    #[test]
    fn status_wait_sees_finish() {
        let status = StatusRef::new();
        let s2 = status.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            s2.with(|s| s.http_return_code = 200);
            s2.set_finished();
        });
        status.wait_finished();
        assert_eq!(status.snapshot().http_return_code, 200);
        handle.join().unwrap();
    }
}
