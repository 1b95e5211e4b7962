//! Small flag- and path-scanning helpers used by the request normalizer.

use std::collections::BTreeMap;

/// Collects every `-fdebug-prefix-map=FROM=TO` into an ordered map.
pub fn parse_debug_prefix_maps(args: &[String]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for arg in args {
        if let Some(value) = arg.strip_prefix("-fdebug-prefix-map=") {
            if let Some((from, to)) = value.split_once('=') {
                map.insert(from.to_string(), to.to_string());
            }
        }
    }
    map
}

/// Whether the command line makes debug info depend on the working
/// directory: `-g` / `-gN` (N > 0, last one wins), `-gsplit-dwarf`, or a
/// `-fdebug-prefix-map`.
pub fn has_debug_flag(args: &[String]) -> bool {
    let mut debug = false;
    for arg in args {
        match arg.as_str() {
            "-g" | "-gsplit-dwarf" => debug = true,
            "-g0" => debug = false,
            _ => {
                if let Some(level) = arg.strip_prefix("-g") {
                    if level.chars().all(|c| c.is_ascii_digit()) && !level.is_empty() {
                        debug = level != "0";
                    } else if level.starts_with("gdb")
                        || level.starts_with("dwarf")
                        || level.starts_with("line-tables-only")
                    {
                        debug = true;
                    }
                }
                if arg.starts_with("-fdebug-prefix-map=") {
                    debug = true;
                }
            }
        }
    }
    debug
}

/// Rewrites `path` through the longest matching prefix of the map.
/// Returns `None` when no key matches.
pub fn rewrite_path_with_debug_prefix_map(
    map: &BTreeMap<String, String>,
    path: &str,
) -> Option<String> {
    let mut best: Option<(&str, &str)> = None;
    for (from, to) in map {
        if path.starts_with(from.as_str())
            && best.map(|(f, _)| from.len() > f.len()).unwrap_or(true)
        {
            best = Some((from, to));
        }
    }
    best.map(|(from, to)| format!("{}{}", to, &path[from.len()..]))
}

/// A map where one key is a strict prefix of another rewrites the same
/// path two ways; such maps inhibit rewriting entirely.
pub fn has_ambiguity_in_debug_prefix_map(map: &BTreeMap<String, String>) -> bool {
    let keys: Vec<&String> = map.keys().collect();
    for (i, a) in keys.iter().enumerate() {
        for b in keys.iter().skip(i + 1) {
            if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                return true;
            }
        }
    }
    false
}

/// Stable signature of a map, used in log lines when a rewrite is
/// inhibited.
pub fn debug_prefix_map_signature(map: &BTreeMap<String, String>) -> String {
    let mut sig = String::new();
    for (from, to) in map {
        sig.push_str(from);
        sig.push('=');
        sig.push_str(to);
        sig.push(';');
    }
    sig
}

pub fn is_absolute_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Makes `path` cwd-relative when it lives under `cwd`; absolute paths
/// elsewhere are returned unchanged.
pub fn relative_from_cwd(cwd: &str, path: &str) -> String {
    if cwd.is_empty() || !is_absolute_path(path) {
        return path.to_string();
    }
    if path == cwd {
        return ".".to_string();
    }
    let mut prefix = cwd.to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    match path.strip_prefix(&prefix) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Directory depth of `path` relative to `cwd`: the number of separators
/// in its cwd-relative form. Used to order inputs deterministically.
pub fn path_depth_from_cwd(cwd: &str, path: &str) -> usize {
    relative_from_cwd(cwd, path).matches('/').count()
}

/// Returns the last path component.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn debug_flag_detection() {
        assert!(has_debug_flag(&args(&["gcc", "-g", "-c"])));
        assert!(has_debug_flag(&args(&["gcc", "-g2"])));
        assert!(has_debug_flag(&args(&["gcc", "-gsplit-dwarf"])));
        assert!(has_debug_flag(&args(&["gcc", "-fdebug-prefix-map=/a=/b"])));
        assert!(!has_debug_flag(&args(&["gcc", "-c", "-O2"])));
        // The last -g level wins.
        assert!(!has_debug_flag(&args(&["gcc", "-g", "-g0"])));
        assert!(has_debug_flag(&args(&["gcc", "-g0", "-g3"])));
    }

    #[test]
    fn prefix_map_longest_wins() {
        let mut map = BTreeMap::new();
        map.insert("/home".to_string(), "/h".to_string());
        map.insert("/home/alice".to_string(), "/a".to_string());
        assert_eq!(
            rewrite_path_with_debug_prefix_map(&map, "/home/alice/src"),
            Some("/a/src".to_string())
        );
        assert_eq!(
            rewrite_path_with_debug_prefix_map(&map, "/home/bob"),
            Some("/h/bob".to_string())
        );
        assert_eq!(rewrite_path_with_debug_prefix_map(&map, "/tmp/x"), None);
        assert!(has_ambiguity_in_debug_prefix_map(&map));
    }

    #[test]
    fn unambiguous_map() {
        let mut map = BTreeMap::new();
        map.insert("/home/alice".to_string(), "/base_dir".to_string());
        assert!(!has_ambiguity_in_debug_prefix_map(&map));
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_from_cwd("/src", "/src/a/b.c"), "a/b.c");
        assert_eq!(relative_from_cwd("/src", "/other/b.c"), "/other/b.c");
        assert_eq!(relative_from_cwd("/src", "rel.c"), "rel.c");
        assert_eq!(relative_from_cwd("/src", "/src"), ".");
        assert_eq!(path_depth_from_cwd("/src", "/src/a/b/c.c"), 2);
        assert_eq!(basename("/a/b/c.c"), "c.c");
    }
}
