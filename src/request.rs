//! The canonical compile request.
//!
//! After normalization (see [`crate::normalize`]) the serialized form of a
//! [`CompileRequest`] is the remote cache key: two developers issuing
//! semantically identical builds must produce byte-identical serializations.
//! Bincode's deterministic little-endian encoding makes the stability of
//! that serialization a testable invariant.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of the compiler binary being mimicked remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub version: String,
    pub target: String,
    /// Hash of the local compiler binary.
    pub binary_hash: String,
    pub local_compiler_path: String,
    pub system_include_paths: Vec<String>,
    pub cxx_system_include_paths: Vec<String>,
    pub system_framework_paths: Vec<String>,
}

/// One input file. `hash_key` identifies the content in the remote file
/// store; `content` is an optional inline copy that never participates in
/// the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInput {
    pub filename: String,
    pub hash_key: String,
    pub content: Option<Vec<u8>>,
}

/// Auxiliary tool (linker plugin, objcopy) whose content hash contributes
/// to the cache key but whose path does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subprogram {
    pub path: String,
    pub binary_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub command_spec: CommandSpec,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub inputs: Vec<RequestInput>,
    pub subprograms: Vec<Subprogram>,
    pub expected_output_files: Vec<String>,
    pub requester_info: Option<String>,
}

impl CompileRequest {
    /// The canonical byte form; stable across processes and platforms.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("compile request serialization cannot fail")
    }

    /// Hex digest of the canonical bytes, used as the cache lookup key.
    pub fn cache_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_is_stable() {
        let req = CompileRequest {
            args: vec!["gcc".to_string(), "-c".to_string(), "a.c".to_string()],
            cwd: "/src".to_string(),
            ..Default::default()
        };
        assert_eq!(req.canonical_bytes(), req.clone().canonical_bytes());
        assert_eq!(req.cache_digest(), req.cache_digest());
        assert_eq!(req.cache_digest().len(), 64);
    }

    #[test]
    fn content_changes_bytes_but_is_dropped_by_normalization_elsewhere() {
        let mut a = CompileRequest::default();
        let mut b = CompileRequest::default();
        a.inputs.push(RequestInput {
            filename: "a.c".to_string(),
            hash_key: "k".to_string(),
            content: None,
        });
        b.inputs.push(RequestInput {
            filename: "a.c".to_string(),
            hash_key: "k".to_string(),
            content: Some(vec![1, 2, 3]),
        });
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }
}
