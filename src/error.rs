use std::io;

/// Error kinds of the dispatcher, independent of transport.
///
/// Transport-level retries are bounded and exponential; subprocess-level
/// failures are returned to the caller or reported via a `Terminated`
/// record. Preprocessor errors are non-fatal by default.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Logical failure with a message; not retried above the HTTP layer.
    #[error("{0}")]
    Fail(String),

    /// Blocking I/O exceeded its budget.
    #[error("i/o timed out")]
    Timeout,

    /// The socket factory produced no usable socket.
    #[error("failed to connect to backend servers")]
    ConnectFailed,

    /// Non-2xx HTTP response.
    #[error("http status {0}")]
    HttpStatus(i32),

    /// Error emitted by the TLS engine during handshake, read, or write.
    /// Always fatal for the current connection.
    #[error("tls: {0}")]
    Tls(String),

    /// A multi-RPC job canceled at shutdown.
    #[error("multi_rpc canceled")]
    Canceled,

    /// Admission control or shutdown prevented a subprocess launch.
    #[error("subprocess not started")]
    SubprocessNotStarted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Compact error code carried in RPC status records.
///
/// Mirrors the wire-level result of a single HTTP RPC; the richer
/// [`Error`] is used at API boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    Ok,
    Fail,
    Timeout,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}
