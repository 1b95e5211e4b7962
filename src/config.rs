//! The dispatcher's recognized option set.

use std::time::Duration;

use crate::http::{HttpClientOptions, multi::MultiRpcOptions};
use crate::subprocess::SubProcessOptions;

/// Everything the dispatcher reads at startup. Grouped by the subsystem
/// that consumes each knob.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// The helper installs a crash handler before serving.
    pub enable_crash_dump: bool,

    // Subprocess admission caps.
    pub max_subprocs: usize,
    pub max_subprocs_low_priority: usize,
    pub max_subprocs_heavy_weight: usize,
    /// On shutdown, let children finish naturally.
    pub dont_kill_subprocess: bool,

    // Transport.
    pub use_ssl: bool,
    pub dest_host_name: String,
    pub dest_port: u16,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub url_path_prefix: String,
    pub content_type_for_protobuf: String,
    /// gzip the request body and accept compressed responses.
    pub start_compression: bool,

    // Multi-RPC batching.
    pub multi_rpc_max_req_in_call: usize,
    pub multi_rpc_req_size_threshold_in_call: usize,
    pub multi_rpc_check_interval_ms: u64,

    /// Worker threads in the general pool; 0 means `num_cpus + 1`.
    pub num_worker_threads: usize,
}

impl Default for DispatcherOptions {
    fn default() -> DispatcherOptions {
        let multi = MultiRpcOptions::default();
        let subproc = SubProcessOptions::default();
        let http = HttpClientOptions::default();
        DispatcherOptions {
            enable_crash_dump: false,
            max_subprocs: subproc.max_subprocs,
            max_subprocs_low_priority: subproc.max_subprocs_low_priority,
            max_subprocs_heavy_weight: subproc.max_subprocs_heavy_weight,
            dont_kill_subprocess: subproc.dont_kill_subprocess,
            use_ssl: false,
            dest_host_name: String::new(),
            dest_port: 0,
            proxy_host: String::new(),
            proxy_port: 0,
            url_path_prefix: String::new(),
            content_type_for_protobuf: http.content_type_for_protobuf,
            start_compression: false,
            multi_rpc_max_req_in_call: multi.max_req_in_call,
            multi_rpc_req_size_threshold_in_call: multi.req_size_threshold_in_call,
            multi_rpc_check_interval_ms: multi.check_interval.as_millis() as u64,
            num_worker_threads: 0,
        }
    }
}

impl DispatcherOptions {
    pub fn http_client_options(&self) -> HttpClientOptions {
        HttpClientOptions {
            dest_host_name: self.dest_host_name.clone(),
            dest_port: self.dest_port,
            use_ssl: self.use_ssl,
            proxy_host_name: self.proxy_host.clone(),
            proxy_port: self.proxy_port,
            url_path_prefix: self.url_path_prefix.clone(),
            content_type_for_protobuf: self.content_type_for_protobuf.clone(),
            start_compression: self.start_compression,
            ..HttpClientOptions::default()
        }
    }

    pub fn multi_rpc_options(&self) -> MultiRpcOptions {
        MultiRpcOptions {
            max_req_in_call: self.multi_rpc_max_req_in_call,
            req_size_threshold_in_call: self.multi_rpc_req_size_threshold_in_call,
            check_interval: Duration::from_millis(self.multi_rpc_check_interval_ms),
        }
    }

    pub fn subprocess_options(&self) -> SubProcessOptions {
        SubProcessOptions {
            max_subprocs: self.max_subprocs,
            max_subprocs_low_priority: self.max_subprocs_low_priority,
            max_subprocs_heavy_weight: self.max_subprocs_heavy_weight,
            dont_kill_subprocess: self.dont_kill_subprocess,
        }
    }

    pub fn worker_threads(&self) -> usize {
        if self.num_worker_threads > 0 {
            self.num_worker_threads
        } else {
            crate::machine::num_cpus() + 1
        }
    }
}
