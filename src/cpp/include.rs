//! Include resolution interfaces and include-guard bookkeeping.

use std::collections::HashMap;

use super::CppParser;

/// External collaborator that resolves `#include "X"` / `<X>` to content
/// (by pushing it with [`CppParser::add_string_input`]) and answers
/// `__has_include` queries.
pub trait IncludeObserver {
    /// Resolves and pushes an include. Returns false when the file cannot
    /// be found. Implementations should consult
    /// [`CppParser::is_processed_file`] first and report a skip by
    /// returning true without pushing anything.
    fn handle_include(
        &mut self,
        parser: &mut CppParser,
        path: &str,
        current_directory: &str,
        current_filepath: &str,
        quote_char: char,
        include_dir_index: usize,
    ) -> bool;

    fn has_include(
        &mut self,
        path: &str,
        current_directory: &str,
        current_filepath: &str,
        quote_char: char,
        include_dir_index: usize,
    ) -> bool;
}

pub trait ErrorObserver {
    fn handle_error(&mut self, error: &str);
}

/// Include-guard detection state for one input file.
///
/// The canonical forms
///
/// ```text
/// #ifndef GUARD            #if !defined(GUARD)
/// #define GUARD             #define GUARD
///   ...body...               ...body...
/// #endif                   #endif
/// ```
///
/// are recognized only when the *entire* file is one such block; any
/// token outside it, or a non-trivial condition, invalidates detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardState {
    /// Nothing significant seen yet.
    Start,
    /// Saw the opening `#ifndef GUARD`; waiting for `#define GUARD`.
    AfterIfndef(String),
    /// Inside the guarded block at conditional depth >= 1.
    InBlock(String),
    /// The guarded block closed; any further content invalidates.
    Closed(String),
    Invalid,
}

impl GuardState {
    pub fn invalidate(&mut self) {
        *self = GuardState::Invalid;
    }

    /// The detected guard macro if the file turned out to be one canonical
    /// block.
    pub fn detected(&self) -> Option<&str> {
        match self {
            GuardState::Closed(name) => Some(name),
            _ => None,
        }
    }
}

/// Per-include-directory table of detected guards and `#pragma once`
/// files, used to suppress re-reads.
#[derive(Default)]
pub struct IncludeGuardTable {
    // (include_dir_index, path) -> guard macro
    guards: HashMap<(usize, String), String>,
    pragma_once: HashMap<(usize, String), ()>,
    import_once: HashMap<(usize, String), ()>,
}

impl IncludeGuardTable {
    pub fn record_guard(&mut self, dir_index: usize, path: &str, guard: &str) {
        self.guards
            .insert((dir_index, path.to_string()), guard.to_string());
    }

    pub fn guard_of(&self, dir_index: usize, path: &str) -> Option<&str> {
        self.guards
            .get(&(dir_index, path.to_string()))
            .map(|s| s.as_str())
    }

    pub fn record_pragma_once(&mut self, dir_index: usize, path: &str) {
        self.pragma_once.insert((dir_index, path.to_string()), ());
    }

    pub fn has_pragma_once(&self, dir_index: usize, path: &str) -> bool {
        self.pragma_once.contains_key(&(dir_index, path.to_string()))
    }

    pub fn record_import(&mut self, dir_index: usize, path: &str) {
        self.import_once.insert((dir_index, path.to_string()), ());
    }

    pub fn was_imported(&self, dir_index: usize, path: &str) -> bool {
        self.import_once.contains_key(&(dir_index, path.to_string()))
    }
}
