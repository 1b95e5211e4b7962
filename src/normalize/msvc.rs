//! MSVC-family (cl, clang-cl) normalization rules.

use std::collections::BTreeMap;

use super::{keep, Config, ConfigurableExecReqNormalizer};
use crate::request::CompileRequest;

pub struct VcExecReqNormalizer;

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter()
        .any(|a| a == flag || a.as_str() == flag.replace('/', "-"))
}

/// The `-Xclang -fdebug-compilation-dir X` triple (clang-cl spelling)
/// makes debug info name `X` as the compilation directory instead of cwd.
fn debug_compilation_dir(args: &[String]) -> Option<String> {
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "-fdebug-compilation-dir" {
            if let Some(dir) = iter.peek() {
                return Some((*dir).clone());
            }
        }
        if let Some(dir) = arg.strip_prefix("-fdebug-compilation-dir=") {
            return Some(dir.to_string());
        }
    }
    None
}

impl ConfigurableExecReqNormalizer for VcExecReqNormalizer {
    fn configure(
        &self,
        _id: u64,
        args: &[String],
        normalize_include_path: bool,
        is_linking: bool,
        _normalize_weak_relative_for_arg: &[String],
        _debug_prefix_map: &BTreeMap<String, String>,
        _req: &CompileRequest,
    ) -> Config {
        if is_linking {
            return Config::as_is();
        }

        // Diagnostics that can leak full paths force both cwd and input
        // filename retention.
        let leaks_paths = has_flag(args, "/showIncludes")
            || args.iter().any(|a| a.starts_with("/showIncludes"))
            || has_flag(args, "/FC")
            || args.iter().any(|a| a == "-fdiagnostics-absolute-paths");

        let debug = has_flag(args, "/Z7")
            || has_flag(args, "/Zi")
            || has_flag(args, "/ZI")
            || args.iter().any(|a| a == "-g");

        let coverage = args.iter().any(|a| a == "-fprofile-instr-generate")
            && args.iter().any(|a| a == "-fcoverage-mapping");

        let compilation_dir = debug_compilation_dir(args);

        let keep_cwd = if leaks_paths || coverage {
            keep::AS_IS
        } else if debug {
            match &compilation_dir {
                // Debug info names the override instead of cwd.
                Some(_) => keep::NORMALIZE_WITH_CWD,
                None => keep::AS_IS,
            }
        } else {
            keep::OMIT
        };

        let keep_pathnames = if leaks_paths {
            keep::AS_IS
        } else {
            keep::NORMALIZE_WITH_CWD
        };

        let keep_system_include_dirs = if normalize_include_path {
            keep::NORMALIZE_WITH_CWD
        } else {
            keep::AS_IS
        };

        Config {
            keep_cwd,
            keep_args: keep::AS_IS,
            keep_pathnames_in_input: keep_pathnames,
            keep_system_include_dirs,
            new_cwd: compilation_dir,
        }
    }
}
