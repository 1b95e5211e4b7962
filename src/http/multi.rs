//! Multi-RPC batching.
//!
//! For each path enabled for batching, one open [`MultiJob`] collects
//! logical calls until it reaches `max_req_in_call` calls, its aggregate
//! request size crosses `req_size_threshold_in_call`, or the periodic
//! checker fires; shutdown dispatches immediately. A batch of exactly one
//! call is sent as a plain RPC to the non-batched path. A 404 from the
//! batched path disables batching for the client's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::rpc::StatusRef;
use super::HttpClient;
use crate::error::ErrorCode;
use crate::task::{PermanentTask, Task};
use crate::worker::{PeriodicTaskId, Priority, WorkerPool, WorkerThread};

/// Combined request sent to the batched path.
#[derive(Debug, Serialize, Deserialize)]
pub struct MultiRequest {
    pub requests: Vec<Vec<u8>>,
}

/// Combined response from the batched path: a per-item status code and
/// payload, index-aligned with the request.
#[derive(Debug, Serialize, Deserialize)]
pub struct MultiResponse {
    pub statuses: Vec<i32>,
    pub responses: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct MultiRpcOptions {
    pub max_req_in_call: usize,
    pub req_size_threshold_in_call: usize,
    pub check_interval: Duration,
}

impl Default for MultiRpcOptions {
    fn default() -> MultiRpcOptions {
        MultiRpcOptions {
            max_req_in_call: 5,
            req_size_threshold_in_call: 1 << 20,
            check_interval: Duration::from_millis(500),
        }
    }
}

/// One logical call queued into a batch. Its callback runs on the
/// submitter's thread; `finished` is set there too, exactly once.
struct Job {
    submitter: Option<Arc<WorkerThread>>,
    status: StatusRef,
    req: Vec<u8>,
    callback: Mutex<Option<Task>>,
    queued_at: Instant,
}

impl Job {
    fn done(&self, wm: &Arc<WorkerPool>) {
        let callback = self.callback.lock().unwrap().take();
        let status = self.status.clone();
        let task = Task::oneshot(move || {
            status.set_finished();
            if let Some(cb) = callback {
                cb.run();
            }
        });
        match &self.submitter {
            Some(worker) => worker.run_task(crate::from_here!(), task, Priority::Med),
            None => wm.run(crate::from_here!(), task, Priority::Med),
        }
    }
}

#[derive(Default)]
struct MultiJobState {
    jobs: Vec<Job>,
    req_size: usize,
    dispatched: bool,
}

/// A pending batch: *collecting* until dispatched, then *completed* (every
/// child finished) or *canceled* (shutdown).
struct MultiJob {
    state: Mutex<MultiJobState>,
    combined_status: StatusRef,
}

impl MultiJob {
    fn new() -> Arc<MultiJob> {
        Arc::new(MultiJob {
            state: Mutex::new(MultiJobState::default()),
            combined_status: StatusRef::new(),
        })
    }

    fn add_call(&self, status: StatusRef, req: Vec<u8>, callback: Option<Task>) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(!st.dispatched);
        st.req_size += req.len();
        st.jobs.push(Job {
            submitter: WorkerThread::current(),
            status,
            req,
            callback: Mutex::new(callback),
            queued_at: Instant::now(),
        });
    }

    fn num_calls(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    fn req_size(&self) -> usize {
        self.state.lock().unwrap().req_size
    }

    fn call(self: Arc<Self>, rpc: Arc<MultiRpc>) {
        let (num_calls, first_snapshot, combined_req) = {
            let mut st = self.state.lock().unwrap();
            debug_assert!(!st.jobs.is_empty());
            st.dispatched = true;
            let first = st.jobs[0].status.snapshot();
            for job in &st.jobs {
                job.status.with(|s| {
                    s.pending_time = job.queued_at.elapsed();
                });
            }
            let reqs: Vec<Vec<u8>> = st.jobs.iter().map(|j| j.req.clone()).collect();
            (st.jobs.len(), first, reqs)
        };

        // The combined call inherits the first child's authorization-bearing
        // fields (timeout, trace id).
        self.combined_status.with(|s| {
            s.timeout = first_snapshot.timeout;
            s.trace_id = first_snapshot.trace_id.clone();
        });

        if num_calls == 1 {
            info!("rpc single to {}", rpc.path);
            let me = Arc::clone(&self);
            let rpc2 = Arc::clone(&rpc);
            rpc.http.call_with_callback(
                &rpc.path,
                combined_req.into_iter().next().unwrap(),
                self.combined_status.clone(),
                Some(Task::oneshot(move || me.single_done(rpc2))),
            );
            return;
        }

        {
            let st = self.state.lock().unwrap();
            for job in &st.jobs {
                job.status.with(|s| {
                    s.master_trace_id = first_snapshot.trace_id.clone();
                });
            }
        }
        info!("rpc multi to {} num_call={}", rpc.multi_path, num_calls);
        let body = bincode::serialize(&MultiRequest {
            requests: combined_req,
        })
        .expect("multi request serialization cannot fail");
        let me = Arc::clone(&self);
        let rpc2 = Arc::clone(&rpc);
        rpc.http.call_with_callback(
            &rpc.multi_path,
            body,
            self.combined_status.clone(),
            Some(Task::oneshot(move || me.done(rpc2))),
        );
    }

    /// Combined-call completion for a batch of one.
    fn single_done(self: Arc<Self>, rpc: Arc<MultiRpc>) {
        let snap = self.combined_status.snapshot();
        let st = self.state.lock().unwrap();
        debug_assert_eq!(st.jobs.len(), 1);
        let job = &st.jobs[0];
        job.status.with(|s| {
            let pending = s.pending_time;
            let finished = s.finished;
            *s = snap.clone();
            s.pending_time = pending;
            // The waiting side owns the finished transition.
            s.finished = finished;
        });
        job.done(rpc.http.wm());
        drop(st);
        rpc.job_done();
    }

    /// Combined-call completion: fan stats to the first child, success or
    /// failure to all of them.
    fn done(self: Arc<Self>, rpc: Arc<MultiRpc>) {
        let snap = self.combined_status.snapshot();
        if !snap.err.is_ok() {
            warn!("multi rpc failed: {}", snap.err_message);
            if snap.http_return_code == 404 {
                rpc.disable();
            }
        }
        let decoded: Option<MultiResponse> = if snap.err.is_ok() {
            bincode::deserialize(&snap.response_body).ok()
        } else {
            None
        };
        let st = self.state.lock().unwrap();
        for (i, job) in st.jobs.iter().enumerate() {
            job.status.with(|s| {
                if i == 0 {
                    // Size and time stats are stored on the first call only.
                    s.req_size = snap.req_size;
                    s.resp_size = snap.resp_size;
                    s.raw_req_size = snap.raw_req_size;
                    s.raw_resp_size = snap.raw_resp_size;
                    s.req_build_time = snap.req_build_time;
                    s.req_send_time = snap.req_send_time;
                    s.wait_time = snap.wait_time;
                    s.resp_recv_time = snap.resp_recv_time;
                    s.resp_parse_time = snap.resp_parse_time;
                    s.num_retry = snap.num_retry;
                }
                match &decoded {
                    Some(multi) if i < multi.statuses.len() => {
                        s.http_return_code = multi.statuses[i];
                        s.response_body =
                            multi.responses.get(i).cloned().unwrap_or_default();
                    }
                    Some(_) => s.http_return_code = 500,
                    None => s.http_return_code = snap.http_return_code,
                }
                s.connect_success = true;
                s.err = snap.err;
                s.err_message = snap.err_message.clone();
                if s.err.is_ok() && s.http_return_code != 200 {
                    s.err = ErrorCode::Fail;
                    s.err_message = format!(
                        "MultiCall ok:{} but SingleCall error:{}",
                        snap.err_message, s.http_return_code
                    );
                }
                s.response_header = snap.response_header.clone();
            });
            job.done(rpc.http.wm());
        }
        drop(st);
        rpc.job_done();
    }

    /// Fails every collected call without dispatching. Only legal before
    /// `call`.
    fn cancel(self: Arc<Self>, rpc: &MultiRpc) {
        let st = self.state.lock().unwrap();
        debug_assert!(!st.dispatched);
        for job in &st.jobs {
            job.status.with(|s| {
                s.connect_success = false;
                s.err = ErrorCode::Fail;
                s.err_message = "multi_rpc canceled".to_string();
            });
            job.done(&rpc.wm);
        }
    }
}

struct MultiInner {
    pending: HashMap<String, Arc<MultiJob>>,
    periodic_id: Option<PeriodicTaskId>,
    num_active_jobs: usize,
    available: bool,
    num_call_by_req_num: usize,
    num_call_by_req_size: usize,
    num_call_by_latency: usize,
    num_call_by_multi: Vec<usize>,
}

/// Batching front end for one RPC path pair (`path`, `multi_path`).
pub struct MultiRpc {
    wm: Arc<WorkerPool>,
    http: Arc<HttpClient>,
    path: String,
    multi_path: String,
    options: MultiRpcOptions,
    inner: Mutex<MultiInner>,
    cond: Condvar,
}

impl MultiRpc {
    pub fn new(
        http: Arc<HttpClient>,
        path: String,
        multi_path: String,
        options: MultiRpcOptions,
        wm: Arc<WorkerPool>,
    ) -> Arc<MultiRpc> {
        assert!(options.max_req_in_call > 0);
        let slots = options.max_req_in_call + 1;
        Arc::new(MultiRpc {
            wm,
            http,
            path,
            multi_path,
            options,
            inner: Mutex::new(MultiInner {
                pending: HashMap::new(),
                periodic_id: None,
                num_active_jobs: 0,
                available: true,
                num_call_by_req_num: 0,
                num_call_by_req_size: 0,
                num_call_by_latency: 0,
                num_call_by_multi: vec![0; slots],
            }),
            cond: Condvar::new(),
        })
    }

    /// Batch key for a request; `""` batches everything on this path
    /// together.
    fn multi_job_key(&self, _req: &[u8]) -> String {
        String::new()
    }

    pub fn available(&self) -> bool {
        self.inner.lock().unwrap().available
    }

    /// Queues one logical call. Dispatches the open batch when full, when
    /// the aggregate size crosses the threshold, or at shutdown.
    pub fn call(
        self: &Arc<Self>,
        status: StatusRef,
        req: Vec<u8>,
        callback: Option<Task>,
    ) {
        let direct = {
            let inner = self.inner.lock().unwrap();
            !inner.available || self.options.max_req_in_call == 1
        };
        if direct {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.num_call_by_multi[1] += 1;
            }
            self.http.call_with_callback(&self.path, req, status, callback);
            return;
        }

        let to_dispatch = {
            let mut inner = self.inner.lock().unwrap();
            if !self.http.shutting_down() && inner.periodic_id.is_none() {
                let me = Arc::clone(self);
                inner.periodic_id = Some(self.wm.register_periodic(
                    crate::from_here!(),
                    self.options.check_interval,
                    PermanentTask::new(move || me.check_pending()),
                ));
            }
            let key = self.multi_job_key(&req);
            let job = inner
                .pending
                .entry(key.clone())
                .or_insert_with(MultiJob::new)
                .clone();
            job.add_call(status, req, callback);
            let mut call_now = self.http.shutting_down();
            if job.num_calls() == self.options.max_req_in_call {
                inner.num_call_by_req_num += 1;
                call_now = true;
            } else if job.req_size() >= self.options.req_size_threshold_in_call {
                inner.num_call_by_req_size += 1;
                call_now = true;
            }
            if call_now {
                inner.pending.remove(&key);
                inner.num_active_jobs += 1;
                let n = job.num_calls().min(self.options.max_req_in_call);
                inner.num_call_by_multi[n] += 1;
                Some(job)
            } else {
                None
            }
        };
        if let Some(job) = to_dispatch {
            job.call(Arc::clone(self));
        }
    }

    /// Periodic latency-based dispatch: sends any batch holding at least
    /// one call. Runs on the alarm worker.
    fn check_pending(self: &Arc<Self>) {
        let (jobs, periodic_to_drop) = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<String> = inner
                .pending
                .iter()
                .filter(|(_, job)| job.num_calls() > 0)
                .map(|(k, _)| k.clone())
                .collect();
            let mut jobs = Vec::new();
            for key in keys {
                if let Some(job) = inner.pending.remove(&key) {
                    inner.num_active_jobs += 1;
                    inner.num_call_by_latency += 1;
                    let n = job.num_calls().min(self.options.max_req_in_call);
                    inner.num_call_by_multi[n] += 1;
                    jobs.push(job);
                }
            }
            let drop_id = if !inner.available {
                inner.periodic_id.take()
            } else {
                None
            };
            (jobs, drop_id)
        };
        for job in jobs {
            let me = Arc::clone(self);
            self.wm.run(
                crate::from_here!(),
                Task::oneshot(move || job.call(me)),
                Priority::Med,
            );
        }
        if let Some(id) = periodic_to_drop {
            // Unregistration blocks; hop off the alarm worker first.
            info!("unregister periodic checker for {}", self.multi_path);
            let wm = Arc::clone(&self.wm);
            self.wm.run(
                crate::from_here!(),
                Task::oneshot(move || wm.unregister_periodic(id)),
                Priority::Immediate,
            );
        }
    }

    /// Cancels pending batches and waits until in-flight ones finish. Call
    /// with the HTTP client already shutting down.
    pub fn wait(self: &Arc<Self>) {
        debug_assert!(self.http.shutting_down());
        let periodic = {
            let mut inner = self.inner.lock().unwrap();
            inner.periodic_id.take()
        };
        if let Some(id) = periodic {
            self.wm.unregister_periodic(id);
        }
        let canceled: Vec<Arc<MultiJob>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.drain().map(|(_, job)| job).collect()
        };
        for job in canceled {
            job.cancel(self);
        }
        let mut inner = self.inner.lock().unwrap();
        while inner.num_active_jobs > 0 {
            info!("num_active_jobs={}", inner.num_active_jobs);
            inner = self.cond.wait(inner).unwrap();
        }
    }

    fn disable(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.available {
            warn!("disable multi call {}", self.multi_path);
        }
        inner.available = false;
    }

    fn job_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.num_active_jobs -= 1;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut s = format!("path={}\n", self.path);
        if inner.available {
            s.push_str(&format!(
                "multi_path={}\n max req in call={} : call={}\n req size threshold in call={} : call={}\n check interval={:?} : call={}\n",
                self.multi_path,
                self.options.max_req_in_call,
                inner.num_call_by_req_num,
                self.options.req_size_threshold_in_call,
                inner.num_call_by_req_size,
                self.options.check_interval,
                inner.num_call_by_latency
            ));
        } else {
            s.push_str("multi_call disabled\n");
        }
        s.push_str("num call by multi:\n");
        for (i, n) in inner.num_call_by_multi.iter().enumerate().skip(1) {
            s.push_str(&format!("{} reqs in call={}\n", i, n));
        }
        s
    }
}
