//! Dialects that normalize very little.
//!
//! clang-tidy, Java, and Javac builds embed their working directory and
//! file names in outputs and diagnostics; only system include paths (which
//! the remote side supplies itself) are cleared.

use std::collections::BTreeMap;

use super::{keep, Config, ConfigurableExecReqNormalizer};
use crate::request::CompileRequest;

fn keep_almost_everything() -> Config {
    Config {
        keep_cwd: keep::AS_IS,
        keep_args: keep::AS_IS,
        keep_pathnames_in_input: keep::AS_IS,
        keep_system_include_dirs: keep::OMIT,
        new_cwd: None,
    }
}

pub struct ClangTidyExecReqNormalizer;

impl ConfigurableExecReqNormalizer for ClangTidyExecReqNormalizer {
    fn configure(
        &self,
        _id: u64,
        _args: &[String],
        _normalize_include_path: bool,
        _is_linking: bool,
        _normalize_weak_relative_for_arg: &[String],
        _debug_prefix_map: &BTreeMap<String, String>,
        _req: &CompileRequest,
    ) -> Config {
        keep_almost_everything()
    }
}

pub struct JavaExecReqNormalizer;

impl ConfigurableExecReqNormalizer for JavaExecReqNormalizer {
    fn configure(
        &self,
        _id: u64,
        _args: &[String],
        _normalize_include_path: bool,
        _is_linking: bool,
        _normalize_weak_relative_for_arg: &[String],
        _debug_prefix_map: &BTreeMap<String, String>,
        _req: &CompileRequest,
    ) -> Config {
        keep_almost_everything()
    }
}

pub struct JavacExecReqNormalizer;

impl ConfigurableExecReqNormalizer for JavacExecReqNormalizer {
    fn configure(
        &self,
        _id: u64,
        _args: &[String],
        _normalize_include_path: bool,
        _is_linking: bool,
        _normalize_weak_relative_for_arg: &[String],
        _debug_prefix_map: &BTreeMap<String, String>,
        _req: &CompileRequest,
    ) -> Config {
        keep_almost_everything()
    }
}

/// Keeps the request untouched apart from the always-applied passes
/// (input order, content, subprograms, env, requester).
pub struct AsIsExecReqNormalizer;

impl ConfigurableExecReqNormalizer for AsIsExecReqNormalizer {
    fn configure(
        &self,
        _id: u64,
        _args: &[String],
        _normalize_include_path: bool,
        _is_linking: bool,
        _normalize_weak_relative_for_arg: &[String],
        _debug_prefix_map: &BTreeMap<String, String>,
        _req: &CompileRequest,
    ) -> Config {
        Config::as_is()
    }
}
