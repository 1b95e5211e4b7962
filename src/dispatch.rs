//! End-to-end flow for one compile invocation:
//!
//! ```text
//! invoke -> normalize -> scan includes -> ship request
//!                                      -> receive result -> emit objects
//!                  on failure path -> run the local compiler
//! ```
//!
//! The [`Context`] owns the singletons (worker pool, HTTP client,
//! subprocess client), created during `init` and torn down in reverse
//! order; callers pass it around instead of reaching for globals.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DispatcherOptions;
use crate::cpp::{CppParser, IncludeObserver};
use crate::error::{Error, ErrorCode, Result};
use crate::flags::{basename, parse_debug_prefix_maps};
use crate::http::{HttpClient, StatusRef};
use crate::normalize::{gcc::default_weak_relative_args, normalizer_for};
use crate::request::{CommandSpec, CompileRequest, RequestInput};
use crate::socket_factory::TcpSocketFactory;
use crate::subprocess::{
    client::{local_run_request, start_with_thread_server, SubProcess},
    SubProcessClient, SubProcessPriority, SubProcessWeight,
};
use crate::tls::RustlsEngineFactory;
use crate::worker::WorkerPool;

/// RPC path of the compile endpoint.
pub const EXEC_PATH: &str = "/e";

/// Wire reply of the compile endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub ok: bool,
    pub error_message: String,
    pub outputs: Vec<OutputFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    pub content: Vec<u8>,
}

/// One intercepted compiler invocation.
#[derive(Debug, Clone, Default)]
pub struct CompileInvocation {
    pub args: Vec<String>,
    pub cwd: String,
    pub env: Vec<String>,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub cache_key: String,
    /// Whether the result came from the remote cluster (false after a
    /// local fallback).
    pub remote: bool,
    pub exit_status: i32,
}

/// Owns the dispatcher's long-lived subsystems.
pub struct Context {
    wm: Arc<WorkerPool>,
    http: Arc<HttpClient>,
    subprocess: Arc<SubProcessClient>,
    subprocess_server: Option<std::thread::JoinHandle<()>>,
    options: DispatcherOptions,
}

impl Context {
    pub fn new(options: DispatcherOptions) -> Result<Context> {
        let wm = WorkerPool::new(options.worker_threads())?;
        let factory = Box::new(TcpSocketFactory::new(
            if options.proxy_host.is_empty() {
                options.dest_host_name.clone()
            } else {
                options.proxy_host.clone()
            },
            if options.proxy_host.is_empty() {
                options.dest_port
            } else {
                options.proxy_port
            },
        ));
        let tls = if options.use_ssl {
            Some(Box::new(RustlsEngineFactory::new()) as Box<dyn crate::tls::TlsEngineFactory>)
        } else {
            None
        };
        let http = HttpClient::new(options.http_client_options(), factory, tls, Arc::clone(&wm));
        let (subprocess, server) =
            start_with_thread_server(Arc::clone(&wm), options.subprocess_options())?;
        Ok(Context {
            wm,
            http,
            subprocess,
            subprocess_server: Some(server),
            options,
        })
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.wm
    }

    pub fn http_client(&self) -> &Arc<HttpClient> {
        &self.http
    }

    pub fn subprocess_client(&self) -> &Arc<SubProcessClient> {
        &self.subprocess
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    /// Tears subsystems down in reverse creation order.
    pub fn shutdown(mut self) {
        self.http.shutdown();
        self.subprocess.shutdown();
        if let Some(server) = self.subprocess_server.take() {
            let _ = server.join();
        }
        self.wm.shutdown();
        self.wm.join();
    }

    /// Runs one invocation remotely, falling back to the local compiler on
    /// any transport failure.
    pub fn dispatch(&self, invocation: &CompileInvocation) -> Result<DispatchOutcome> {
        if invocation.args.is_empty() {
            return Err(Error::Fail("empty command line".to_string()));
        }
        let mut req = build_request(invocation)?;
        scan_includes(invocation, &mut req);

        let mut normalized = req.clone();
        let debug_prefix_map = parse_debug_prefix_maps(&invocation.args);
        let weak = default_weak_relative_args();
        let normalizer = normalizer_for(&invocation.args[0]);
        normalizer.normalize_for_cache_key(
            0,
            true,
            false,
            &weak,
            &debug_prefix_map,
            &mut normalized,
        );
        let cache_key = normalized.cache_digest();
        info!("dispatch {} key={}", invocation.args[0], cache_key);

        match self.call_remote(&normalized) {
            Ok(resp) if resp.ok => {
                for output in &resp.outputs {
                    let path = resolve_output(&invocation.cwd, &output.filename);
                    std::fs::write(&path, &output.content)?;
                }
                Ok(DispatchOutcome {
                    cache_key,
                    remote: true,
                    exit_status: 0,
                })
            }
            Ok(resp) => {
                // The server compiled and failed; that is the build's
                // answer, not a transport problem.
                Err(Error::Fail(resp.error_message))
            }
            Err(err) => {
                warn!("remote compile failed, running locally: {}", err);
                let status = self.run_local(invocation)?;
                Ok(DispatchOutcome {
                    cache_key,
                    remote: false,
                    exit_status: status,
                })
            }
        }
    }

    fn call_remote(&self, req: &CompileRequest) -> Result<ExecResponse> {
        let status = StatusRef::new();
        self.http
            .call_bytes(EXEC_PATH, req.canonical_bytes(), &status);
        let snap = status.snapshot();
        if !snap.connect_success {
            return Err(Error::ConnectFailed);
        }
        match snap.err {
            ErrorCode::Ok => {}
            ErrorCode::Timeout => return Err(Error::Timeout),
            ErrorCode::Fail => {
                if snap.http_return_code != 0 && snap.http_return_code != 200 {
                    return Err(Error::HttpStatus(snap.http_return_code));
                }
                return Err(Error::Fail(snap.err_message));
            }
        }
        bincode::deserialize(&snap.response_body)
            .map_err(|e| Error::Fail(format!("malformed exec response: {}", e)))
    }

    fn run_local(&self, invocation: &CompileInvocation) -> Result<i32> {
        let prog = &invocation.args[0];
        let req = local_run_request(
            prog,
            &invocation.args,
            &invocation.env,
            &invocation.cwd,
            SubProcessPriority::High,
            SubProcessWeight::Normal,
        );
        let task = SubProcess::new(Arc::clone(&self.subprocess), req);
        task.start(None);
        let terminated = task.wait();
        if terminated.error != crate::subprocess::TerminatedError::None
            && terminated.status < 0
        {
            return Err(Error::SubprocessNotStarted);
        }
        Ok(terminated.status)
    }
}

fn build_request(invocation: &CompileInvocation) -> Result<CompileRequest> {
    let argv0 = &invocation.args[0];
    let mut expected_outputs = Vec::new();
    let mut iter = invocation.args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            if let Some(out) = iter.next() {
                expected_outputs.push(out.clone());
            }
        }
    }
    Ok(CompileRequest {
        command_spec: CommandSpec {
            name: basename(argv0).to_string(),
            local_compiler_path: argv0.clone(),
            ..Default::default()
        },
        args: invocation.args.clone(),
        env: invocation.env.clone(),
        cwd: invocation.cwd.clone(),
        inputs: Vec::new(),
        subprograms: Vec::new(),
        expected_output_files: expected_outputs,
        requester_info: None,
    })
}

fn resolve_output(cwd: &str, filename: &str) -> PathBuf {
    let path = Path::new(filename);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(cwd).join(path)
    }
}

fn source_files(args: &[String]) -> Vec<String> {
    args.iter()
        .skip(1)
        .filter(|a| {
            !a.starts_with('-')
                && Path::new(a.as_str())
                    .extension()
                    .map(|e| {
                        matches!(
                            e.to_string_lossy().as_ref(),
                            "c" | "cc" | "cpp" | "cxx" | "m" | "mm" | "h" | "hpp"
                        )
                    })
                    .unwrap_or(false)
        })
        .cloned()
        .collect()
}

fn include_dirs(args: &[String], cwd: &str) -> Vec<String> {
    let mut dirs = vec![cwd.to_string()];
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "-I" {
            if let Some(dir) = iter.peek() {
                dirs.push(resolve_output(cwd, dir).to_string_lossy().into_owned());
            }
        } else if let Some(dir) = arg.strip_prefix("-I") {
            dirs.push(resolve_output(cwd, dir).to_string_lossy().into_owned());
        }
    }
    dirs
}

/// Scans the translation units for their header closure and appends every
/// read file to `req.inputs` with its content hash.
fn scan_includes(invocation: &CompileInvocation, req: &mut CompileRequest) {
    let dirs = include_dirs(&invocation.args, &invocation.cwd);
    let observer = Rc::new(RefCell::new(FsIncludeObserver::new(dirs.clone())));
    let mut parser = CppParser::new();
    let cplusplus = matches!(
        Path::new(&invocation.args[0])
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
            .as_str(),
        "g++" | "c++" | "clang++"
    );
    parser.set_is_cplusplus(cplusplus);
    parser.set_include_observer(observer.clone());

    for source in source_files(&invocation.args) {
        let path = resolve_output(&invocation.cwd, &source);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                observer
                    .borrow_mut()
                    .record_file(&path.to_string_lossy(), content.as_bytes());
                parser.add_string_input(&content, &path.to_string_lossy());
                parser.process_directives();
            }
            Err(err) => warn!("cannot read source {}: {}", source, err),
        }
    }

    let observer = observer.borrow();
    let mut inputs: Vec<RequestInput> = observer
        .visited
        .iter()
        .map(|(path, hash)| RequestInput {
            filename: path.clone(),
            hash_key: hash.clone(),
            content: None,
        })
        .collect();
    inputs.sort_by(|a, b| a.filename.cmp(&b.filename));
    req.inputs = inputs;
}

/// Resolves includes against the real filesystem.
struct FsIncludeObserver {
    include_dirs: Vec<String>,
    visited: HashMap<String, String>,
}

impl FsIncludeObserver {
    fn new(include_dirs: Vec<String>) -> FsIncludeObserver {
        FsIncludeObserver {
            include_dirs,
            visited: HashMap::new(),
        }
    }

    fn record_file(&mut self, path: &str, content: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let digest = hasher.finalize();
        let mut hash = String::with_capacity(64);
        for b in digest {
            hash.push_str(&format!("{:02x}", b));
        }
        self.visited.insert(path.to_string(), hash);
    }

    fn resolve(
        &self,
        path: &str,
        current_directory: &str,
        quote_char: char,
    ) -> Option<PathBuf> {
        if Path::new(path).is_absolute() {
            let p = PathBuf::from(path);
            return p.is_file().then_some(p);
        }
        if quote_char == '"' && !current_directory.is_empty() {
            let candidate = Path::new(current_directory).join(path);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        for dir in &self.include_dirs {
            let candidate = Path::new(dir).join(path);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

impl IncludeObserver for FsIncludeObserver {
    fn handle_include(
        &mut self,
        parser: &mut CppParser,
        path: &str,
        current_directory: &str,
        _current_filepath: &str,
        quote_char: char,
        include_dir_index: usize,
    ) -> bool {
        let Some(resolved) = self.resolve(path, current_directory, quote_char) else {
            return false;
        };
        let resolved_str = resolved.to_string_lossy().into_owned();
        if parser.is_processed_file(&resolved_str, include_dir_index) {
            return true;
        }
        match std::fs::read_to_string(&resolved) {
            Ok(content) => {
                self.record_file(&resolved_str, content.as_bytes());
                parser.add_string_input_at(&content, &resolved_str, include_dir_index);
                true
            }
            Err(err) => {
                warn!("cannot read include {}: {}", resolved_str, err);
                false
            }
        }
    }

    fn has_include(
        &mut self,
        path: &str,
        current_directory: &str,
        _current_filepath: &str,
        quote_char: char,
        _include_dir_index: usize,
    ) -> bool {
        self.resolve(path, current_directory, quote_char).is_some()
    }
}
