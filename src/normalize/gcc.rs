//! GCC-family (gcc, g++, clang, clang++) normalization rules.

use std::collections::BTreeMap;

use super::{keep, Config, ConfigurableExecReqNormalizer};
use crate::flags::has_debug_flag;
use crate::request::CompileRequest;

pub struct GccExecReqNormalizer;

impl GccExecReqNormalizer {
    /// Debug builds normally pin the cwd into the key. The one escape
    /// hatch: a build under `/proc/self/cwd` whose prefix map covers that
    /// spelling produces cwd-independent debug info.
    fn cwd_covered_by_proc_self_cwd(
        debug_prefix_map: &BTreeMap<String, String>,
        req: &CompileRequest,
    ) -> bool {
        let pwd_is_proc_self = req
            .env
            .iter()
            .any(|kv| kv == "PWD=/proc/self/cwd" || kv.starts_with("PWD=/proc/self/cwd/"));
        pwd_is_proc_self
            && debug_prefix_map
                .keys()
                .any(|k| k == "/proc/self/cwd" || k.starts_with("/proc/self/cwd/"))
    }
}

impl ConfigurableExecReqNormalizer for GccExecReqNormalizer {
    fn configure(
        &self,
        _id: u64,
        args: &[String],
        normalize_include_path: bool,
        is_linking: bool,
        normalize_weak_relative_for_arg: &[String],
        debug_prefix_map: &BTreeMap<String, String>,
        req: &CompileRequest,
    ) -> Config {
        if is_linking {
            // Link lines embed paths in too many ways to canonicalize.
            return Config::as_is();
        }

        let debug = has_debug_flag(args);
        let has_map = !debug_prefix_map.is_empty();

        let keep_cwd = if debug {
            if Self::cwd_covered_by_proc_self_cwd(debug_prefix_map, req) {
                keep::OMIT
            } else if has_map {
                // Paths are rewritten through the map first; what the map
                // normalizes away no longer pins the key.
                keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP
            } else {
                keep::AS_IS
            }
        } else {
            keep::OMIT
        };

        let mut keep_args = if normalize_weak_relative_for_arg.is_empty() {
            keep::AS_IS
        } else {
            keep::NORMALIZE_WITH_CWD
        };
        if has_map && keep_args != keep::AS_IS {
            keep_args |= keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP;
        } else if has_map && keep_args == keep::AS_IS {
            // Even when args otherwise stay as-is, equivalent maps must
            // normalize to the same spelling.
            keep_args = keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP;
        }

        let mut keep_pathnames = if debug && !has_map {
            keep::AS_IS
        } else if has_map {
            keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP | keep::NORMALIZE_WITH_CWD
        } else {
            keep::NORMALIZE_WITH_CWD
        };
        // Dependency-file output (-MD family) names inputs as written.
        if args.iter().any(|a| a == "-MMD" || a == "-MM" || a == "-MD") {
            keep_pathnames = keep::AS_IS;
        }

        let keep_system_include_dirs = if !normalize_include_path {
            keep::AS_IS
        } else if has_map {
            keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP | keep::NORMALIZE_WITH_CWD
        } else {
            keep::NORMALIZE_WITH_CWD
        };

        Config {
            keep_cwd,
            keep_args,
            keep_pathnames_in_input: keep_pathnames,
            keep_system_include_dirs,
            new_cwd: None,
        }
    }
}

/// The flag list whose path values may be made cwd-relative for this
/// family.
pub fn default_weak_relative_args() -> Vec<String> {
    [
        "-I",
        "-B",
        "--sysroot=",
        "-resource-dir=",
        "-gcc-toolchain=",
        "-Xclang",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
