//! Request normalization for cache-key equivalence.
//!
//! A per-dialect strategy configures which parts of a [`CompileRequest`]
//! stay in the key; the shared passes below then canonicalize it in place.
//! Post-normalization, the request is a pure function of the user's
//! intent: cwd, `PWD`/`DEVELOPER_DIR` environment, requester identity, and
//! debug-prefix-mapped path spellings no longer influence the bytes.

pub mod gcc;
pub mod msvc;
pub mod simple;

pub use gcc::GccExecReqNormalizer;
pub use msvc::VcExecReqNormalizer;
pub use simple::{
    AsIsExecReqNormalizer, ClangTidyExecReqNormalizer, JavaExecReqNormalizer,
    JavacExecReqNormalizer,
};

use std::collections::BTreeMap;

use log::{info, warn};

use crate::flags::{
    basename, debug_prefix_map_signature, has_ambiguity_in_debug_prefix_map,
    path_depth_from_cwd, relative_from_cwd, rewrite_path_with_debug_prefix_map,
};
use crate::request::CompileRequest;

/// Knob values for the `keep_*` configuration fields, bit-flag composable.
pub mod keep {
    pub const OMIT: u8 = 0;
    pub const NORMALIZE_WITH_CWD: u8 = 1 << 0;
    pub const NORMALIZE_WITH_DEBUG_PREFIX_MAP: u8 = 1 << 1;
    pub const PRESERVE_I: u8 = 1 << 2;
    pub const AS_IS: u8 = 1 << 3;
}

/// What a dialect strategy decided to keep.
#[derive(Debug, Clone)]
pub struct Config {
    pub keep_cwd: u8,
    pub keep_args: u8,
    pub keep_pathnames_in_input: u8,
    pub keep_system_include_dirs: u8,
    /// Replaces cwd (used for `-fdebug-compilation-dir`); itself subject to
    /// the debug prefix map. Ignored when `keep_cwd` is `AS_IS`.
    pub new_cwd: Option<String>,
}

impl Config {
    pub fn as_is() -> Config {
        Config {
            keep_cwd: keep::AS_IS,
            keep_args: keep::AS_IS,
            keep_pathnames_in_input: keep::AS_IS,
            keep_system_include_dirs: keep::AS_IS,
            new_cwd: None,
        }
    }
}

/// Interface for request normalization. `req` is modified in place; `id`
/// tags log lines.
pub trait ExecReqNormalizer {
    fn normalize_for_cache_key(
        &self,
        id: u64,
        normalize_include_path: bool,
        is_linking: bool,
        normalize_weak_relative_for_arg: &[String],
        debug_prefix_map: &BTreeMap<String, String>,
        req: &mut CompileRequest,
    );
}

/// Dialect strategies implement only `configure`; the shared passes do the
/// rest.
pub trait ConfigurableExecReqNormalizer {
    #[allow(clippy::too_many_arguments)]
    fn configure(
        &self,
        id: u64,
        args: &[String],
        normalize_include_path: bool,
        is_linking: bool,
        normalize_weak_relative_for_arg: &[String],
        debug_prefix_map: &BTreeMap<String, String>,
        req: &CompileRequest,
    ) -> Config;
}

impl<T: ConfigurableExecReqNormalizer> ExecReqNormalizer for T {
    fn normalize_for_cache_key(
        &self,
        id: u64,
        normalize_include_path: bool,
        is_linking: bool,
        normalize_weak_relative_for_arg: &[String],
        debug_prefix_map: &BTreeMap<String, String>,
        req: &mut CompileRequest,
    ) {
        let args = req.args.clone();
        let mut config = self.configure(
            id,
            &args,
            normalize_include_path,
            is_linking,
            normalize_weak_relative_for_arg,
            debug_prefix_map,
            req,
        );
        let signature = debug_prefix_map_signature(debug_prefix_map);
        if has_ambiguity_in_debug_prefix_map(debug_prefix_map) {
            // Two keys rewriting the same path differently would make the
            // key depend on map iteration order; keep paths as they are.
            warn!(
                "id={} ambiguous debug prefix map inhibits rewrite: {}",
                id, signature
            );
            config.keep_cwd = strip_map_flag(config.keep_cwd);
            config.keep_args = strip_map_flag(config.keep_args);
            config.keep_pathnames_in_input = strip_map_flag(config.keep_pathnames_in_input);
            config.keep_system_include_dirs =
                strip_map_flag(config.keep_system_include_dirs);
        }
        info!(
            "id={} normalize: cwd={:#x} args={:#x} pathnames={:#x} sysincludes={:#x}",
            id,
            config.keep_cwd,
            config.keep_args,
            config.keep_pathnames_in_input,
            config.keep_system_include_dirs
        );

        normalize_input_order(req);
        drop_input_content(req);
        normalize_pathnames_in_input(
            config.keep_pathnames_in_input,
            debug_prefix_map,
            req,
        );
        normalize_system_include_dirs(
            config.keep_system_include_dirs,
            debug_prefix_map,
            req,
        );
        normalize_args(
            config.keep_args,
            normalize_weak_relative_for_arg,
            debug_prefix_map,
            req,
        );
        normalize_cwd(config.keep_cwd, &config.new_cwd, debug_prefix_map, req);
        normalize_subprograms(req);
        normalize_envs(req);
        req.requester_info = None;
    }
}

fn strip_map_flag(flags: u8) -> u8 {
    if flags == keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP {
        keep::AS_IS
    } else {
        flags & !keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP
    }
}

/// Stable-sorts inputs by `(depth-from-cwd, filename)` so independent
/// builds produce identical key bytes.
fn normalize_input_order(req: &mut CompileRequest) {
    let cwd = req.cwd.clone();
    req.inputs.sort_by(|a, b| {
        let da = path_depth_from_cwd(&cwd, &a.filename);
        let db = path_depth_from_cwd(&cwd, &b.filename);
        da.cmp(&db).then_with(|| a.filename.cmp(&b.filename))
    });
}

/// Embedded content never participates in the key; only `hash_key` does.
fn drop_input_content(req: &mut CompileRequest) {
    for input in &mut req.inputs {
        input.content = None;
    }
}

fn normalize_path(keep: u8, cwd: &str, map: &BTreeMap<String, String>, path: &str) -> String {
    if keep & keep::AS_IS != 0 {
        return path.to_string();
    }
    // The map is applied first; relativization then runs against the
    // mapped cwd so that normalizing twice is the identity.
    let (path, base) = if keep & keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP != 0 {
        (
            rewrite_path_with_debug_prefix_map(map, path)
                .unwrap_or_else(|| path.to_string()),
            rewrite_path_with_debug_prefix_map(map, cwd)
                .unwrap_or_else(|| cwd.to_string()),
        )
    } else {
        (path.to_string(), cwd.to_string())
    };
    if keep & keep::NORMALIZE_WITH_CWD != 0 {
        return relative_from_cwd(&base, &path);
    }
    path
}

fn normalize_pathnames_in_input(
    keep_flags: u8,
    map: &BTreeMap<String, String>,
    req: &mut CompileRequest,
) {
    if keep_flags & keep::AS_IS != 0 {
        return;
    }
    let cwd = req.cwd.clone();
    for input in &mut req.inputs {
        input.filename = if keep_flags == keep::OMIT {
            basename(&input.filename).to_string()
        } else {
            normalize_path(keep_flags, &cwd, map, &input.filename)
        };
    }
}

fn normalize_system_include_dirs(
    keep_flags: u8,
    map: &BTreeMap<String, String>,
    req: &mut CompileRequest,
) {
    if keep_flags & keep::AS_IS != 0 {
        return;
    }
    let cwd = req.cwd.clone();
    let spec = &mut req.command_spec;
    if keep_flags == keep::OMIT {
        spec.system_include_paths.clear();
        spec.cxx_system_include_paths.clear();
        spec.system_framework_paths.clear();
        return;
    }
    for list in [
        &mut spec.system_include_paths,
        &mut spec.cxx_system_include_paths,
        &mut spec.system_framework_paths,
    ] {
        for p in list.iter_mut() {
            *p = normalize_path(keep_flags, &cwd, map, p);
        }
    }
}

/// Flags whose path arguments may be made cwd-relative. Joined
/// (`-Ifoo`, `--sysroot=foo`) and separated (`-I foo`, `-Xclang foo`)
/// spellings are both handled.
fn normalize_args(
    keep_flags: u8,
    weak_args: &[String],
    map: &BTreeMap<String, String>,
    req: &mut CompileRequest,
) {
    if keep_flags & keep::AS_IS != 0 {
        return;
    }
    let cwd = req.cwd.clone();
    let mut out: Vec<String> = Vec::with_capacity(req.args.len());
    let mut rewrite_next = false;
    for arg in &req.args {
        if keep_flags & keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP != 0
            && arg.starts_with("-fdebug-prefix-map=")
        {
            // The map itself must not stay in the key: requests that only
            // differ in equivalent maps normalize identically.
            continue;
        }
        if rewrite_next {
            rewrite_next = false;
            out.push(normalize_path(keep_flags, &cwd, map, arg));
            continue;
        }
        let mut handled = false;
        for flag in weak_args {
            if flag.ends_with('=') {
                if let Some(value) = arg.strip_prefix(flag.as_str()) {
                    out.push(format!(
                        "{}{}",
                        flag,
                        normalize_path(keep_flags, &cwd, map, value)
                    ));
                    handled = true;
                    break;
                }
            } else if arg == flag {
                rewrite_next = true;
                out.push(arg.clone());
                handled = true;
                break;
            } else if keep_flags & keep::PRESERVE_I == 0 {
                if let Some(value) = arg.strip_prefix(flag.as_str()) {
                    out.push(format!(
                        "{}{}",
                        flag,
                        normalize_path(keep_flags, &cwd, map, value)
                    ));
                    handled = true;
                    break;
                }
            }
        }
        if !handled {
            out.push(arg.clone());
        }
    }
    req.args = out;
}

fn normalize_cwd(
    keep_flags: u8,
    new_cwd: &Option<String>,
    map: &BTreeMap<String, String>,
    req: &mut CompileRequest,
) {
    if keep_flags & keep::AS_IS != 0 {
        return;
    }
    if let Some(new_cwd) = new_cwd {
        req.cwd = new_cwd.clone();
    }
    if keep_flags == keep::OMIT {
        req.cwd.clear();
        return;
    }
    if keep_flags & keep::NORMALIZE_WITH_DEBUG_PREFIX_MAP != 0 {
        if let Some(rewritten) = rewrite_path_with_debug_prefix_map(map, &req.cwd) {
            req.cwd = rewritten;
        }
    }
}

/// Subprogram paths are blanked; only their content hash matters.
fn normalize_subprograms(req: &mut CompileRequest) {
    for sub in &mut req.subprograms {
        sub.path.clear();
    }
    req.subprograms
        .sort_by(|a, b| a.binary_hash.cmp(&b.binary_hash));
}

/// Ephemeral environment never reaches the key.
fn normalize_envs(req: &mut CompileRequest) {
    req.env.retain(|kv| {
        !kv.starts_with("PWD=") && !kv.starts_with("DEVELOPER_DIR=")
    });
}

/// Compiler families the normalizer can route on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerFamily {
    Gcc,
    Msvc,
    ClangTidy,
    Java,
    Javac,
    Unknown,
}

/// Routes on the basename of argv[0], lowercased and `.exe`-stripped.
pub fn compiler_family(argv0: &str) -> CompilerFamily {
    let base = basename(argv0)
        .to_ascii_lowercase()
        .trim_end_matches(".exe")
        .to_string();
    // A version-suffixed name like gcc-12 routes like its stem.
    let stem = base
        .split_once('-')
        .map(|(stem, suffix)| {
            if suffix.chars().all(|c| c.is_ascii_digit() || c == '.') {
                stem.to_string()
            } else {
                base.clone()
            }
        })
        .unwrap_or_else(|| base.clone());
    match stem.as_str() {
        "gcc" | "g++" | "cc" | "c++" | "clang" | "clang++" => CompilerFamily::Gcc,
        "cl" | "clang-cl" => CompilerFamily::Msvc,
        "clang-tidy" => CompilerFamily::ClangTidy,
        "java" => CompilerFamily::Java,
        "javac" => CompilerFamily::Javac,
        _ => CompilerFamily::Unknown,
    }
}

/// The normalizer for `argv0`'s compiler family.
pub fn normalizer_for(argv0: &str) -> Box<dyn ExecReqNormalizer> {
    match compiler_family(argv0) {
        CompilerFamily::Gcc => Box::new(GccExecReqNormalizer),
        CompilerFamily::Msvc => Box::new(VcExecReqNormalizer),
        CompilerFamily::ClangTidy => Box::new(ClangTidyExecReqNormalizer),
        CompilerFamily::Java => Box::new(JavaExecReqNormalizer),
        CompilerFamily::Javac => Box::new(JavacExecReqNormalizer),
        CompilerFamily::Unknown => Box::new(AsIsExecReqNormalizer),
    }
}
