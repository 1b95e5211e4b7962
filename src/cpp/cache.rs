//! Process-wide macro-environment cache.
//!
//! Keyed by `(file, include_dir_index, incoming-macro-environment
//! fingerprint)`; the value is the macro-table delta the file produced
//! when it was first scanned. A revisit under an identical macro state
//! replays the delta without reading the file. Files that reference or
//! define compiler-supplied predefined macros (`__has_feature` and
//! friends) are never cached: their effect depends on the side table, not
//! only on the macro environment.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use super::macros::Macro;

/// One recorded macro-table mutation.
#[derive(Debug, Clone)]
pub enum MacroDelta {
    Define(Macro),
    Undef(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub include_dir_index: usize,
    pub env_fingerprint: u64,
}

#[derive(Default)]
pub struct MacroEnvCache {
    entries: Mutex<HashMap<CacheKey, Vec<MacroDelta>>>,
    hits: Mutex<u64>,
}

impl MacroEnvCache {
    pub fn new() -> MacroEnvCache {
        MacroEnvCache::default()
    }

    pub fn store(&self, key: CacheKey, deltas: Vec<MacroDelta>) {
        self.entries.lock().unwrap().insert(key, deltas);
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Vec<MacroDelta>> {
        let found = self.entries.lock().unwrap().get(key).cloned();
        if found.is_some() {
            *self.hits.lock().unwrap() += 1;
        }
        found
    }

    pub fn hits(&self) -> u64 {
        *self.hits.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Fingerprint of a macro environment: name plus body spelling of every
/// defined macro, order-independent.
pub fn fingerprint_env<'a, I>(macros: I) -> u64
where
    I: Iterator<Item = (&'a String, &'a Macro)>,
{
    let mut entries: Vec<(&String, String)> = macros
        .map(|(name, m)| {
            let mut h = DefaultHasher::new();
            m.params.hash(&mut h);
            m.is_variadic.hash(&mut h);
            for t in &m.body {
                t.spelling().hash(&mut h);
            }
            (name, format!("{:x}", h.finish()))
        })
        .collect();
    entries.sort();
    let mut h = DefaultHasher::new();
    entries.hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpp::token::CppToken;

    #[test]
    fn fingerprint_is_order_independent() {
        let a = Macro::object("A", vec![CppToken::Number(1, "1".to_string())]);
        let b = Macro::object("B", vec![CppToken::Number(2, "2".to_string())]);
        let names = ("A".to_string(), "B".to_string());
        let fwd = fingerprint_env(vec![(&names.0, &a), (&names.1, &b)].into_iter());
        let rev = fingerprint_env(vec![(&names.1, &b), (&names.0, &a)].into_iter());
        assert_eq!(fwd, rev);
    }

    #[test]
    fn fingerprint_tracks_body_changes() {
        let name = "A".to_string();
        let one = Macro::object("A", vec![CppToken::Number(1, "1".to_string())]);
        let two = Macro::object("A", vec![CppToken::Number(2, "2".to_string())]);
        let f1 = fingerprint_env(vec![(&name, &one)].into_iter());
        let f2 = fingerprint_env(vec![(&name, &two)].into_iter());
        assert_ne!(f1, f2);
    }

    #[test]
    fn store_and_lookup() {
        let cache = MacroEnvCache::new();
        let key = CacheKey {
            path: "a.h".to_string(),
            include_dir_index: 1,
            env_fingerprint: 42,
        };
        assert!(cache.lookup(&key).is_none());
        cache.store(key.clone(), vec![MacroDelta::Undef("X".to_string())]);
        assert_eq!(cache.lookup(&key).map(|d| d.len()), Some(1));
        assert_eq!(cache.hits(), 1);
    }
}
