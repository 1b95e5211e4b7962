//! remcc — client-side dispatcher for distributed C/C++ compilation.
//!
//! The dispatcher intercepts compiler invocations, decides whether each
//! can run remotely, ships a deterministic description of the compilation
//! (sources, headers, flags) to a cluster, receives the produced objects,
//! and falls back to a bounded local subprocess pool on any failure.
//!
//! The crate is built from a few cooperating layers:
//!
//! * [`worker`] — a fixed pool of cooperative worker threads with priority
//!   queues, delayed and periodic tasks, and one descriptor poller per
//!   thread ([`poller`]: epoll, kqueue, or select).
//! * [`descriptor`] / [`tls`] — readiness-driven socket descriptors,
//!   optionally wrapped in a TLS engine with HTTP-CONNECT proxy traversal.
//! * [`http`] — an HTTP/1.1 RPC client with retry, keep-alive,
//!   compression, and multi-RPC request coalescing.
//! * [`subprocess`] — all `fork`/`exec` isolated into one helper process
//!   behind a tagged length-prefixed wire protocol, with per-priority and
//!   per-weight admission control.
//! * [`cpp`] — a directive-level preprocessor (macro expansion, include
//!   guards, `__has_include` and friends) that computes the exact header
//!   closure a compilation needs.
//! * [`normalize`] / [`request`] — per-dialect canonicalization of a
//!   compile command into a deterministic cache key.
//! * [`dispatch`] — the end-to-end flow tying the layers together.
//!
//! No task may block: long I/O is split through descriptor readiness
//! callbacks that re-enter the per-thread dispatch loop.

pub mod config;
pub mod cpp;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod flags;
pub mod http;
pub mod io;
pub mod machine;
pub mod net;
pub mod normalize;
pub mod poller;
pub mod request;
pub mod socket_factory;
pub mod subprocess;
pub mod task;
pub mod tls;
pub mod worker;

pub use config::DispatcherOptions;
pub use dispatch::{CompileInvocation, Context, DispatchOutcome};
pub use error::{Error, ErrorCode, Result};
pub use request::CompileRequest;
pub use task::{CancelableTask, PermanentTask, Task};
pub use worker::{Priority, WorkerPool};
