//! Subprocess controller.
//!
//! All `fork`/`exec` is isolated into a single helper (a forked copy of
//! this process, or a dedicated thread in tests). The main process talks
//! to it over a stream socket pair with tagged length-prefixed records:
//!
//! ```text
//! record := op(int32 LE) length(int32 LE) payload(bytes)
//! ops    := REGISTER | REQUEST_RUN | KILL | SET_OPTION | SHUTDOWN   client->server
//!         | STARTED | TERMINATED                                    server->client
//!         | CLOSED    (synthetic, peer EOF)
//! ```
//!
//! Each payload is an opaque serialized message; the transport neither
//! inspects nor transforms it.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

pub use client::{SubProcess, SubProcessClient};
pub use server::SubProcessServer;

/// Record tags. `Closed` never travels on the wire; the reader synthesizes
/// it on EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Closed = -1,
    Nop = 0,
    Register = 1,
    RequestRun = 2,
    Kill = 3,
    SetOption = 4,
    Shutdown = 5,
    Started = 10,
    Terminated = 11,
}

impl Op {
    pub fn from_i32(v: i32) -> Option<Op> {
        Some(match v {
            -1 => Op::Closed,
            0 => Op::Nop,
            1 => Op::Register,
            2 => Op::RequestRun,
            3 => Op::Kill,
            4 => Op::SetOption,
            5 => Op::Shutdown,
            10 => Op::Started,
            11 => Op::Terminated,
            _ => return None,
        })
    }
}

/// Admission classes. Low-priority runs are capped separately from the
/// total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SubProcessPriority {
    #[default]
    High,
    Low,
}

/// Weight classes; heavy-weight runs (e.g. linking) get their own cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SubProcessWeight {
    #[default]
    Normal,
    Heavy,
}

/// Lifecycle: `Setup -> Pending -> Run -> Finished`, with
/// `* -> Signaled -> Finished` when a kill is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SubProcessState {
    #[default]
    Setup,
    Pending,
    Run,
    Signaled,
    Finished,
}

#[derive(Debug, Clone)]
pub struct SubProcessOptions {
    pub max_subprocs: usize,
    pub max_subprocs_low_priority: usize,
    pub max_subprocs_heavy_weight: usize,
    pub dont_kill_subprocess: bool,
}

impl Default for SubProcessOptions {
    fn default() -> SubProcessOptions {
        SubProcessOptions {
            max_subprocs: 3,
            max_subprocs_low_priority: 1,
            max_subprocs_heavy_weight: 1,
            dont_kill_subprocess: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubProcessReq {
    pub id: i32,
    pub trace_id: String,
    pub prog: String,
    pub argv: Vec<String>,
    pub envs: Vec<String>,
    pub cwd: String,
    pub stdin_filename: String,
    pub stdout_filename: String,
    pub stderr_filename: String,
    pub priority: SubProcessPriority,
    pub weight: SubProcessWeight,
    /// Fire-and-forget: never reported back with a `Terminated`.
    pub detach: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessRun {
    pub id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessKill {
    pub id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessSetOption {
    pub max_subprocs: usize,
    pub max_subprocs_low_priority: usize,
    pub max_subprocs_heavy_weight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessStarted {
    pub id: i32,
    pub pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TerminatedError {
    #[default]
    None,
    Failed,
    Killed,
    /// Admission control or shutdown ended the process before it could be
    /// spawned.
    NotStarted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessTerminated {
    pub id: i32,
    pub status: i32,
    pub error: TerminatedError,
}

pub(crate) const RECORD_HEADER_LEN: usize = 8;

/// Appends one record to `out`.
pub(crate) fn encode_record(op: Op, payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(op as i32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.extend_from_slice(payload);
}

pub(crate) fn encode_message<T: Serialize>(op: Op, msg: &T, out: &mut Vec<u8>) {
    let payload = bincode::serialize(msg).expect("record serialization cannot fail");
    encode_record(op, &payload, out);
}

/// Incremental record parser over a byte stream.
#[derive(Default)]
pub(crate) struct RecordReader {
    buf: Vec<u8>,
}

impl RecordReader {
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete record, if any.
    pub fn next_record(&mut self) -> Option<(i32, Vec<u8>)> {
        if self.buf.len() < RECORD_HEADER_LEN {
            return None;
        }
        let op = i32::from_le_bytes(self.buf[0..4].try_into().unwrap());
        let len = i32::from_le_bytes(self.buf[4..8].try_into().unwrap());
        debug_assert!(len >= 0);
        let len = len.max(0) as usize;
        if self.buf.len() < RECORD_HEADER_LEN + len {
            return None;
        }
        let payload = self.buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len].to_vec();
        self.buf.drain(..RECORD_HEADER_LEN + len);
        Some((op, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let req = SubProcessReq {
            id: 7,
            trace_id: "t".to_string(),
            prog: "/bin/true".to_string(),
            argv: vec!["true".to_string()],
            ..Default::default()
        };
        let mut wire = Vec::new();
        encode_message(Op::Register, &req, &mut wire);
        encode_record(Op::Shutdown, b"", &mut wire);

        let mut reader = RecordReader::default();
        // Feed byte by byte to exercise re-assembly.
        for b in &wire {
            reader.feed(std::slice::from_ref(b));
        }
        let (op, payload) = reader.next_record().unwrap();
        assert_eq!(Op::from_i32(op), Some(Op::Register));
        let decoded: SubProcessReq = bincode::deserialize(&payload).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.prog, "/bin/true");

        let (op, payload) = reader.next_record().unwrap();
        assert_eq!(Op::from_i32(op), Some(Op::Shutdown));
        assert!(payload.is_empty());
        assert!(reader.next_record().is_none());
    }

    #[test]
    fn zero_length_record_is_legal() {
        let mut wire = Vec::new();
        encode_record(Op::Nop, b"", &mut wire);
        assert_eq!(wire.len(), RECORD_HEADER_LEN);
        let mut reader = RecordReader::default();
        reader.feed(&wire);
        let (op, payload) = reader.next_record().unwrap();
        assert_eq!(Op::from_i32(op), Some(Op::Nop));
        assert!(payload.is_empty());
    }
}
