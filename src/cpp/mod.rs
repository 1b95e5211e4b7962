//! Preprocessor core: the include scanner.
//!
//! [`CppParser`] processes only directives — enough to compute the exact
//! set of header inputs a compilation will read. It keeps a stack of input
//! sources, a macro table, per-include-directory visited tables for the
//! include-guard optimization, and (optionally) a process-wide
//! macro-environment cache.
//!
//! Errors are non-fatal: each produces one observer-reported string of the
//! form `CppParser((file):line) text` — the line is where parsing stopped,
//! just past the offending directive — and parsing continues.

pub mod cache;
pub mod expr;
pub mod include;
pub mod macros;
pub mod token;

pub use cache::MacroEnvCache;
pub use include::{ErrorObserver, IncludeObserver};
pub use macros::{Macro, MacroKind};
pub use token::CppToken;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use log::trace;

use cache::{fingerprint_env, CacheKey, MacroDelta};
use include::{GuardState, IncludeGuardTable};
use token::Lexer;

/// Recursive or runaway include chains abort at this depth.
const MAX_INCLUDE_DEPTH: usize = 1024;

/// Compiler-supplied side table: predefined macro text and the value maps
/// behind `__has_feature` and friends. Unknown keys evaluate to 0.
#[derive(Debug, Clone, Default)]
pub struct CompilerInfo {
    pub lang_is_cplusplus: bool,
    pub supported_predefined_macros: HashSet<String>,
    pub predefined_macros: String,
    pub has_feature: HashMap<String, i64>,
    pub has_extension: HashMap<String, i64>,
    pub has_attribute: HashMap<String, i64>,
    pub has_cpp_attribute: HashMap<String, i64>,
    pub has_declspec_attribute: HashMap<String, i64>,
    pub has_builtin: HashMap<String, i64>,
}

/// The `__has_*` check-macro family.
const CHECK_MACROS: &[&str] = &[
    "__has_include",
    "__has_feature",
    "__has_extension",
    "__has_attribute",
    "__has_cpp_attribute",
    "__has_declspec_attribute",
    "__has_builtin",
];

struct Condition {
    active: bool,
    taken: bool,
    parent_active: bool,
}

struct Input {
    lexer: Lexer,
    path: String,
    directory: String,
    include_dir_index: usize,
    guard: GuardState,
    cond_depth_at_entry: usize,
    at_bol: bool,
}

struct Window {
    key: CacheKey,
    deltas: Vec<MacroDelta>,
    uncacheable: bool,
    depth: usize,
}

pub struct CppParser {
    inputs: Vec<Input>,
    macros: HashMap<String, Macro>,
    predefined_names: HashSet<String>,
    conditions: Vec<Condition>,
    include_observer: Option<Rc<RefCell<dyn IncludeObserver>>>,
    error_observer: Option<Rc<RefCell<dyn ErrorObserver>>>,
    compiler_info: CompilerInfo,
    enabled_predefined: HashSet<String>,
    is_cplusplus: bool,
    guard_table: IncludeGuardTable,
    macro_cache: Option<Arc<MacroEnvCache>>,
    windows: Vec<Window>,
    seen_paths: HashSet<String>,
    skipped_files: usize,
    failed: bool,
}

impl Default for CppParser {
    fn default() -> CppParser {
        CppParser::new()
    }
}

impl CppParser {
    pub fn new() -> CppParser {
        CppParser {
            inputs: Vec::new(),
            macros: HashMap::new(),
            predefined_names: HashSet::new(),
            conditions: Vec::new(),
            include_observer: None,
            error_observer: None,
            compiler_info: CompilerInfo::default(),
            enabled_predefined: HashSet::new(),
            is_cplusplus: false,
            guard_table: IncludeGuardTable::default(),
            macro_cache: None,
            windows: Vec::new(),
            seen_paths: HashSet::new(),
            skipped_files: 0,
            failed: false,
        }
    }

    pub fn set_include_observer(&mut self, observer: Rc<RefCell<dyn IncludeObserver>>) {
        self.include_observer = Some(observer);
    }

    pub fn set_error_observer(&mut self, observer: Rc<RefCell<dyn ErrorObserver>>) {
        self.error_observer = Some(observer);
    }

    pub fn set_is_cplusplus(&mut self, yes: bool) {
        self.is_cplusplus = yes;
    }

    pub fn is_cplusplus(&self) -> bool {
        self.is_cplusplus
    }

    pub fn set_macro_env_cache(&mut self, cache: Arc<MacroEnvCache>) {
        self.macro_cache = Some(cache);
    }

    /// Turns on one of the `__has_*` check macros.
    pub fn enable_predefined_macro(&mut self, name: &str) {
        self.enabled_predefined.insert(name.to_string());
    }

    /// Installs the compiler side table: enables its supported check
    /// macros and processes its predefined macro text.
    pub fn set_compiler_info(&mut self, info: CompilerInfo) {
        self.is_cplusplus = info.lang_is_cplusplus;
        for name in &info.supported_predefined_macros {
            self.enabled_predefined.insert(name.clone());
        }
        let predefined = info.predefined_macros.clone();
        self.compiler_info = info;
        if !predefined.is_empty() {
            self.add_string_input(&predefined, "(predefined)");
            self.process_directives();
            // Anything the predefined text defined is owned by the
            // compiler, not the user.
            let names: Vec<String> = self.macros.keys().cloned().collect();
            self.predefined_names.extend(names);
        }
    }

    /// Defines one object-like macro from `name` and `body` text.
    pub fn add_macro_by_string(&mut self, name: &str, body: &str) {
        let mut lexer = Lexer::new(body);
        let mut tokens = Vec::new();
        loop {
            match lexer.next_token(true) {
                CppToken::End | CppToken::Newline => break,
                t => tokens.push(t),
            }
        }
        self.macros
            .insert(name.to_string(), Macro::object(name, tokens));
    }

    /// Pushes an input source. The filename is used for error reporting,
    /// include-guard tables, and the macro-environment cache.
    pub fn add_string_input(&mut self, content: &str, path: &str) {
        self.add_string_input_at(content, path, 0);
    }

    pub fn add_string_input_at(&mut self, content: &str, path: &str, dir_index: usize) {
        let directory = match path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        };
        self.seen_paths.insert(path.to_string());
        self.inputs.push(Input {
            lexer: Lexer::new(content),
            path: path.to_string(),
            directory,
            include_dir_index: dir_index,
            guard: GuardState::Start,
            cond_depth_at_entry: self.conditions.len(),
            at_bol: true,
        });
    }

    /// Unique files pushed so far.
    pub fn total_files(&self) -> usize {
        self.seen_paths.len()
    }

    /// Re-inclusions suppressed by guards, `#pragma once`, `#import`
    /// tracking, or the macro-environment cache.
    pub fn skipped_files(&self) -> usize {
        self.skipped_files
    }

    pub fn is_macro_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn macro_body(&self, name: &str) -> Option<&Macro> {
        self.macros.get(name)
    }

    /// Whether a re-inclusion of `path` can be skipped without reading it.
    /// Counts the skip when it can.
    pub fn is_processed_file(&mut self, path: &str, include_dir_index: usize) -> bool {
        if self.guard_table.has_pragma_once(include_dir_index, path) {
            self.skipped_files += 1;
            return true;
        }
        if let Some(guard) = self.guard_table.guard_of(include_dir_index, path) {
            if self.macros.contains_key(guard) {
                self.skipped_files += 1;
                return true;
            }
        }
        false
    }

    fn report_error(&mut self, msg: &str) {
        let location = match self.inputs.last() {
            Some(input) => format!("{}:{}", input.path, input.lexer.line()),
            None => "(eof):0".to_string(),
        };
        let error = format!("CppParser({}) {}", location, msg);
        trace!("{}", error);
        if let Some(observer) = &self.error_observer {
            let observer = Rc::clone(observer);
            observer.borrow_mut().handle_error(&error);
        }
    }

    /// The next raw token from the input stack; pops exhausted inputs.
    pub fn next_token(&mut self, skip_spaces: bool) -> CppToken {
        loop {
            let Some(input) = self.inputs.last_mut() else {
                return CppToken::End;
            };
            match input.lexer.next_token(skip_spaces) {
                CppToken::End => {
                    self.pop_input();
                }
                t => return t,
            }
        }
    }

    /// Runs the directive scanner over everything on the input stack.
    pub fn process_directives(&mut self) -> bool {
        while !self.inputs.is_empty() {
            let Some(input) = self.inputs.last_mut() else {
                break;
            };
            let at_bol = input.at_bol;
            let tok = input.lexer.next_token(true);
            match tok {
                CppToken::End => {
                    self.pop_input();
                }
                CppToken::Newline => {
                    self.inputs.last_mut().unwrap().at_bol = true;
                }
                CppToken::Sharp if at_bol => {
                    self.inputs.last_mut().unwrap().at_bol = false;
                    let line = self.read_directive_line();
                    self.handle_directive(line);
                    if let Some(input) = self.inputs.last_mut() {
                        input.at_bol = true;
                    }
                }
                _ => {
                    // Token content outside a guard block spoils guard
                    // detection for this file.
                    let active = self.is_active();
                    let input = self.inputs.last_mut().unwrap();
                    input.at_bol = false;
                    if active {
                        match input.guard {
                            GuardState::InBlock(_) => {}
                            _ => input.guard.invalidate(),
                        }
                    }
                }
            }
        }
        !self.failed
    }

    /// Collects the directive's tokens up to (and through) the newline.
    fn read_directive_line(&mut self) -> Vec<CppToken> {
        let mut tokens = Vec::new();
        let Some(input) = self.inputs.last_mut() else {
            return tokens;
        };
        loop {
            match input.lexer.next_token(false) {
                CppToken::End | CppToken::Newline => break,
                t => tokens.push(t),
            }
        }
        tokens
    }

    fn is_active(&self) -> bool {
        self.conditions.iter().all(|c| c.active)
    }

    fn handle_directive(&mut self, tokens: Vec<CppToken>) {
        let tokens = macros::trim_spaces(&tokens).to_vec();
        let Some(CppToken::Identifier(name)) = tokens.first() else {
            // A lone '#' is a legal null directive.
            return;
        };
        let name = name.clone();
        let rest = macros::trim_spaces(&tokens[1..]).to_vec();
        // Any directive after the guard block closed means the guard does
        // not span the whole file. Checked before dispatch so it applies
        // to the including file, not to anything a `#include` pushes.
        if let Some(input) = self.inputs.last_mut() {
            if matches!(input.guard, GuardState::Closed(_))
                && self.conditions.len() == input.cond_depth_at_entry
            {
                input.guard.invalidate();
            }
        }
        match name.as_str() {
            "if" => self.handle_if(&rest),
            "ifdef" => self.handle_ifdef(&rest, false),
            "ifndef" => self.handle_ifdef(&rest, true),
            "elif" => self.handle_elif(&rest),
            "else" => self.handle_else(),
            "endif" => self.handle_endif(),
            _ if !self.is_active() => {}
            "include" => self.handle_include(&rest, false),
            "import" => self.handle_include(&rest, true),
            "define" => self.handle_define(&rest),
            "undef" => self.handle_undef(&rest),
            "error" => {
                self.report_error(&format!("#error {}", macros::spell_tokens(&rest)));
            }
            "pragma" => {
                if rest.first().map(|t| t.is_ident("once")).unwrap_or(false) {
                    let (path, dir_index) = {
                        let input = self.inputs.last().unwrap();
                        (input.path.clone(), input.include_dir_index)
                    };
                    self.guard_table.record_pragma_once(dir_index, &path);
                }
            }
            "line" => {
                if let Some(CppToken::Number(n, _)) =
                    rest.iter().find(|t| !t.is_space())
                {
                    if let Some(input) = self.inputs.last_mut() {
                        input.lexer.set_line(*n as usize);
                    }
                }
            }
            _ => {
                // Unknown directives are ignored, as a compiler would for
                // vendor pragmas.
            }
        }
    }

    fn handle_if(&mut self, rest: &[CppToken]) {
        let parent_active = self.is_active();
        let value = if parent_active {
            self.eval_condition(rest)
        } else {
            false
        };
        self.push_condition(parent_active, value);
        self.note_guard_open(rest, parse_not_defined(rest));
    }

    fn handle_ifdef(&mut self, rest: &[CppToken], negate: bool) {
        let parent_active = self.is_active();
        let value = if parent_active {
            let defined = rest
                .iter()
                .find(|t| !t.is_space())
                .and_then(|t| match t {
                    CppToken::Identifier(n) => Some(self.macros.contains_key(n)),
                    _ => None,
                })
                .unwrap_or(false);
            defined != negate
        } else {
            false
        };
        self.push_condition(parent_active, value);
        let guard = if negate {
            rest.iter().find(|t| !t.is_space()).and_then(|t| match t {
                CppToken::Identifier(n) => Some(n.clone()),
                _ => None,
            })
        } else {
            None
        };
        self.note_guard_open(rest, guard);
    }

    fn push_condition(&mut self, parent_active: bool, value: bool) {
        self.conditions.push(Condition {
            active: parent_active && value,
            taken: !parent_active || value,
            parent_active,
        });
    }

    /// Tracks the opening conditional of a candidate include guard.
    fn note_guard_open(&mut self, _rest: &[CppToken], guard: Option<String>) {
        let depth = self.conditions.len();
        let Some(input) = self.inputs.last_mut() else {
            return;
        };
        let opened_at_top = depth == input.cond_depth_at_entry + 1;
        let next = match (&input.guard, opened_at_top, guard) {
            (GuardState::Start, true, Some(name)) => {
                Some(GuardState::AfterIfndef(name))
            }
            (GuardState::Start, true, None) => Some(GuardState::Invalid),
            // A nested conditional inside the block is fine; anything else
            // at the top level is not a canonical guard file.
            (GuardState::InBlock(_), _, _) => None,
            (_, false, _) => None,
            _ => Some(GuardState::Invalid),
        };
        if let Some(state) = next {
            input.guard = state;
        }
    }

    fn handle_elif(&mut self, rest: &[CppToken]) {
        if self.conditions.is_empty() {
            self.report_error("stray #elif");
            return;
        }
        let idx = self.conditions.len() - 1;
        let (parent_active, taken) = {
            let c = &self.conditions[idx];
            (c.parent_active, c.taken)
        };
        if !parent_active || taken {
            self.conditions[idx].active = false;
        } else {
            let value = self.eval_condition(rest);
            let top = &mut self.conditions[idx];
            top.active = value;
            top.taken |= value;
        }
        self.invalidate_guard_branch();
    }

    fn handle_else(&mut self) {
        let Some(top) = self.conditions.last_mut() else {
            self.report_error("stray #else");
            return;
        };
        top.active = top.parent_active && !top.taken;
        top.taken = true;
        self.invalidate_guard_branch();
    }

    /// An `#elif`/`#else` on the guard's own conditional breaks the
    /// canonical form.
    fn invalidate_guard_branch(&mut self) {
        let depth = self.conditions.len();
        if let Some(input) = self.inputs.last_mut() {
            if depth == input.cond_depth_at_entry + 1
                && matches!(
                    input.guard,
                    GuardState::AfterIfndef(_) | GuardState::InBlock(_)
                )
            {
                input.guard.invalidate();
            }
        }
    }

    fn handle_endif(&mut self) {
        if self.conditions.pop().is_none() {
            self.report_error("stray #endif");
            return;
        }
        let depth = self.conditions.len();
        if let Some(input) = self.inputs.last_mut() {
            if depth == input.cond_depth_at_entry {
                match std::mem::replace(&mut input.guard, GuardState::Invalid) {
                    GuardState::InBlock(name) => {
                        input.guard = GuardState::Closed(name);
                    }
                    other => input.guard = other,
                }
                if matches!(input.guard, GuardState::AfterIfndef(_)) {
                    // Guard opened but never defined its macro.
                    input.guard.invalidate();
                }
            }
        }
    }

    fn handle_define(&mut self, rest: &[CppToken]) {
        let mut iter = rest.iter();
        let Some(CppToken::Identifier(name)) = iter.next() else {
            self.report_error("#define expects an identifier");
            return;
        };
        let name = name.clone();
        let after_name = &rest[1..];
        // A function-like macro requires '(' immediately after the name,
        // with no whitespace.
        let mac = if after_name.first().map(|t| t.is_punct("(")).unwrap_or(false) {
            match parse_macro_params(&after_name[1..]) {
                Some((params, is_variadic, body_start)) => {
                    let body =
                        macros::trim_spaces(&after_name[1 + body_start..]).to_vec();
                    Macro::function(&name, params, is_variadic, body)
                }
                None => {
                    self.report_error("malformed macro parameter list");
                    return;
                }
            }
        } else {
            let body = macros::trim_spaces(after_name).to_vec();
            Macro::object(&name, body)
        };
        self.record_delta(MacroDelta::Define(mac.clone()));
        self.macros.insert(name.clone(), mac);
        self.note_guard_define(&name);
    }

    fn note_guard_define(&mut self, name: &str) {
        let depth = self.conditions.len();
        if let Some(input) = self.inputs.last_mut() {
            let next = match &input.guard {
                GuardState::AfterIfndef(guard) => {
                    if guard == name && depth == input.cond_depth_at_entry + 1 {
                        Some(GuardState::InBlock(guard.clone()))
                    } else {
                        Some(GuardState::Invalid)
                    }
                }
                GuardState::InBlock(_) => None,
                GuardState::Start | GuardState::Closed(_) => Some(GuardState::Invalid),
                GuardState::Invalid => None,
            };
            if let Some(state) = next {
                input.guard = state;
            }
        }
    }

    fn handle_undef(&mut self, rest: &[CppToken]) {
        let Some(CppToken::Identifier(name)) =
            rest.iter().find(|t| !t.is_space()).cloned()
        else {
            self.report_error("#undef expects an identifier");
            return;
        };
        self.record_delta(MacroDelta::Undef(name.clone()));
        self.macros.remove(&name);
        if let Some(input) = self.inputs.last_mut() {
            if !matches!(input.guard, GuardState::InBlock(_) | GuardState::Invalid) {
                input.guard.invalidate();
            }
        }
    }

    fn record_delta(&mut self, delta: MacroDelta) {
        for w in &mut self.windows {
            w.deltas.push(delta.clone());
        }
    }

    fn mark_uncacheable(&mut self) {
        for w in &mut self.windows {
            w.uncacheable = true;
        }
    }

    fn pop_input(&mut self) {
        let Some(input) = self.inputs.pop() else {
            return;
        };
        if self.conditions.len() > input.cond_depth_at_entry {
            self.inputs.push(input);
            self.report_error("unterminated #if block at end of file");
            let input = self.inputs.pop().unwrap();
            self.conditions.truncate(input.cond_depth_at_entry);
            self.finish_input(input);
            return;
        }
        self.finish_input(input);
    }

    fn finish_input(&mut self, input: Input) {
        if let Some(guard) = input.guard.detected() {
            self.guard_table
                .record_guard(input.include_dir_index, &input.path, guard);
        }
        // Close the cache window opened for this file, if any.
        let depth = self.inputs.len() + 1;
        if let Some(pos) = self.windows.iter().rposition(|w| w.depth == depth) {
            let window = self.windows.remove(pos);
            if !window.uncacheable {
                if let Some(cache) = &self.macro_cache {
                    cache.store(window.key, window.deltas);
                }
            }
        }
    }

    // ----- #include ------------------------------------------------------

    fn handle_include(&mut self, rest: &[CppToken], is_import: bool) {
        let parsed = parse_include_target(rest).or_else(|| {
            // The argument may be produced by macros.
            let expanded = self.expand0(rest.to_vec(), false);
            parse_include_target(&expanded)
        });
        let Some((path, quote_char)) = parsed else {
            self.report_error("#include expects \"filename\" or <filename>");
            return;
        };
        if self.inputs.len() >= MAX_INCLUDE_DEPTH {
            self.report_error(&format!(
                "include depth exceeds {}: {}",
                MAX_INCLUDE_DEPTH, path
            ));
            self.failed = true;
            return;
        }
        let (directory, filepath, dir_index) = {
            let input = self.inputs.last().unwrap();
            (
                input.directory.clone(),
                input.path.clone(),
                input.include_dir_index,
            )
        };
        if is_import {
            if self.guard_table.was_imported(dir_index, &path) {
                self.skipped_files += 1;
                return;
            }
            self.guard_table.record_import(dir_index, &path);
        }

        // A cached scan under an identical macro environment replays its
        // macro delta with zero file reads.
        let fingerprint = fingerprint_env(self.macros.iter());
        if let Some(cache) = self.macro_cache.clone() {
            let key = CacheKey {
                path: path.clone(),
                include_dir_index: dir_index,
                env_fingerprint: fingerprint,
            };
            if let Some(deltas) = cache.lookup(&key) {
                for delta in deltas {
                    self.record_delta(delta.clone());
                    match delta {
                        MacroDelta::Define(m) => {
                            self.macros.insert(m.name.clone(), m);
                        }
                        MacroDelta::Undef(name) => {
                            self.macros.remove(&name);
                        }
                    }
                }
                self.skipped_files += 1;
                return;
            }
        }

        let Some(observer) = self.include_observer.clone() else {
            return;
        };
        let depth_before = self.inputs.len();
        let handled = observer.borrow_mut().handle_include(
            self,
            &path,
            &directory,
            &filepath,
            quote_char,
            dir_index,
        );
        if !handled {
            self.report_error(&format!("include file not found: {}", path));
            return;
        }
        if self.inputs.len() > depth_before && self.macro_cache.is_some() {
            self.windows.push(Window {
                key: CacheKey {
                    path,
                    include_dir_index: dir_index,
                    env_fingerprint: fingerprint,
                },
                deltas: Vec::new(),
                uncacheable: false,
                depth: self.inputs.len(),
            });
        }
    }

    // ----- #if evaluation -------------------------------------------------

    fn eval_condition(&mut self, tokens: &[CppToken]) -> bool {
        let mut protected = Vec::new();
        if !self.protect_defined_and_checks(tokens, &mut protected) {
            return false;
        }
        let expanded = self.expand0(protected, false);
        if expanded.is_empty() {
            // Either the directive had no expression or expansion already
            // reported why it produced none; both evaluate false.
            return false;
        }
        match expr::eval_expr(&expanded, self.is_cplusplus) {
            Ok(v) => v != 0,
            Err(msg) => {
                self.report_error(&msg);
                false
            }
        }
    }

    /// Rewrites `defined(X)` and enabled `__has_*` checks into number
    /// tokens before macro expansion; `defined` is syntactic and its
    /// operand never counts as a reference.
    fn protect_defined_and_checks(
        &mut self,
        tokens: &[CppToken],
        out: &mut Vec<CppToken>,
    ) -> bool {
        let mut i = 0;
        while i < tokens.len() {
            let t = &tokens[i];
            if t.is_ident("defined") {
                let (value, next) = self.parse_defined(&tokens[i + 1..]);
                out.push(CppToken::Number(value, value.to_string()));
                i += 1 + next;
                continue;
            }
            if let CppToken::Identifier(name) = t {
                if CHECK_MACROS.contains(&name.as_str())
                    && self.enabled_predefined.contains(name)
                {
                    self.mark_uncacheable();
                    match self.eval_check_macro(name.clone(), &tokens[i + 1..]) {
                        Some((value, consumed)) => {
                            out.push(CppToken::Number(value, value.to_string()));
                            i += 1 + consumed;
                            continue;
                        }
                        None => return false,
                    }
                }
            }
            out.push(t.clone());
            i += 1;
        }
        true
    }

    /// Parses `defined X` / `defined(X)`. Returns the value and how many
    /// tokens past `defined` were consumed.
    fn parse_defined(&self, rest: &[CppToken]) -> (i64, usize) {
        let mut i = 0;
        while rest.get(i).map(|t| t.is_space()).unwrap_or(false) {
            i += 1;
        }
        match rest.get(i) {
            Some(CppToken::Identifier(name)) => {
                ((self.macros.contains_key(name)) as i64, i + 1)
            }
            Some(t) if t.is_punct("(") => {
                let mut j = i + 1;
                while rest.get(j).map(|t| t.is_space()).unwrap_or(false) {
                    j += 1;
                }
                let Some(CppToken::Identifier(name)) = rest.get(j) else {
                    return (0, j);
                };
                let value = self.macros.contains_key(name) as i64;
                let mut k = j + 1;
                while rest.get(k).map(|t| t.is_space()).unwrap_or(false) {
                    k += 1;
                }
                if rest.get(k).map(|t| t.is_punct(")")).unwrap_or(false) {
                    k += 1;
                }
                (value, k)
            }
            _ => (0, i),
        }
    }

    /// Evaluates one `__has_*` invocation. Returns `None` after reporting
    /// an error (the whole condition then evaluates false).
    fn eval_check_macro(
        &mut self,
        name: String,
        rest: &[CppToken],
    ) -> Option<(i64, usize)> {
        let mut i = 0;
        while rest.get(i).map(|t| t.is_space()).unwrap_or(false) {
            i += 1;
        }
        if !rest.get(i).map(|t| t.is_punct("(")).unwrap_or(false) {
            self.report_error(&format!(
                "macro is referred without any arguments:{}",
                name
            ));
            return None;
        }
        let open = i + 1;
        let Some((args, consumed)) = macros::split_args(&rest[open..]) else {
            self.report_error(&format!(
                "{} expects \"filename\" or <filename>",
                name
            ));
            return None;
        };
        let end = open + consumed;
        let arg: Vec<CppToken> = args
            .first()
            .map(|a| macros::trim_spaces(a).to_vec())
            .unwrap_or_default();

        if name == "__has_include" {
            let target = parse_include_target(&arg);
            let Some((path, quote_char)) = target else {
                self.report_error("__has_include expects \"filename\" or <filename>");
                return None;
            };
            let (directory, filepath, dir_index) = {
                let input = self.inputs.last().unwrap();
                (
                    input.directory.clone(),
                    input.path.clone(),
                    input.include_dir_index,
                )
            };
            let found = match self.include_observer.clone() {
                Some(observer) => observer.borrow_mut().has_include(
                    &path,
                    &directory,
                    &filepath,
                    quote_char,
                    dir_index,
                ),
                None => false,
            };
            return Some((found as i64, end));
        }

        if arg.is_empty() {
            self.report_error(&format!("{} expects an argument", name));
            return None;
        }
        // `__has_cpp_attribute(ns::name)` and friends: the key is the
        // spelling of the whole argument.
        let key: String = arg
            .iter()
            .filter(|t| !t.is_space())
            .map(|t| t.spelling())
            .collect();
        let table = match name.as_str() {
            "__has_feature" => &self.compiler_info.has_feature,
            "__has_extension" => &self.compiler_info.has_extension,
            "__has_attribute" => &self.compiler_info.has_attribute,
            "__has_cpp_attribute" => &self.compiler_info.has_cpp_attribute,
            "__has_declspec_attribute" => &self.compiler_info.has_declspec_attribute,
            "__has_builtin" => &self.compiler_info.has_builtin,
            _ => return Some((0, end)),
        };
        let value = table
            .get(&key)
            .copied()
            .or_else(|| {
                // Clang treats __X__ as X in check macros.
                let stripped = key.trim_matches('_');
                if stripped.len() + 4 == key.len() {
                    table.get(stripped).copied()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        Some((value, end))
    }

    // ----- macro expansion ------------------------------------------------

    /// Fully expands `tokens`. Public surface for tests and `#include`
    /// argument handling.
    pub fn expand0(&mut self, tokens: Vec<CppToken>, keep_spaces: bool) -> Vec<CppToken> {
        let mut hide = Vec::new();
        let out = self.expand_list(tokens, &mut hide);
        if keep_spaces {
            out
        } else {
            out.into_iter().filter(|t| !t.is_space()).collect()
        }
    }

    fn expand_list(
        &mut self,
        tokens: Vec<CppToken>,
        hide: &mut Vec<String>,
    ) -> Vec<CppToken> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let t = &tokens[i];
            let CppToken::Identifier(name) = t else {
                out.push(t.clone());
                i += 1;
                continue;
            };
            if hide.contains(name) {
                out.push(t.clone());
                i += 1;
                continue;
            }
            if self.predefined_names.contains(name) {
                self.mark_uncacheable();
            }
            let Some(mac) = self.macros.get(name).cloned() else {
                out.push(t.clone());
                i += 1;
                continue;
            };
            match mac.kind {
                MacroKind::Object => {
                    let substituted = self.substitute(&mac, &[]);
                    hide.push(name.clone());
                    let expanded = self.expand_list(substituted, hide);
                    hide.pop();
                    out.extend(expanded);
                    i += 1;
                }
                MacroKind::Function => {
                    // Only an immediate-ish '(' makes this a call.
                    let mut j = i + 1;
                    while tokens.get(j).map(|t| t.is_space()).unwrap_or(false) {
                        j += 1;
                    }
                    if !tokens.get(j).map(|t| t.is_punct("(")).unwrap_or(false) {
                        out.push(t.clone());
                        i += 1;
                        continue;
                    }
                    let Some((args, consumed)) = macros::split_args(&tokens[j + 1..])
                    else {
                        self.report_error("unterminated macro argument list");
                        out.push(t.clone());
                        i += 1;
                        continue;
                    };
                    let after_call = j + 1 + consumed;
                    if !arity_matches(&mac, &args) {
                        self.report_error(
                            "macro argument number mismatching with the parameter list",
                        );
                        i = after_call;
                        continue;
                    }
                    let substituted = self.substitute_call(&mac, &args, hide);
                    hide.push(name.clone());
                    let expanded = self.expand_list(substituted, hide);
                    hide.pop();
                    out.extend(expanded);
                    i = after_call;
                }
            }
        }
        out
    }

    /// Object-like substitution: the body with `##` pastes applied.
    fn substitute(&mut self, mac: &Macro, _args: &[Vec<CppToken>]) -> Vec<CppToken> {
        apply_pastes(mac.body.clone())
    }

    /// Function-like substitution: parameter replacement, `#` stringize,
    /// `##` paste, and `__VA_ARGS__`.
    fn substitute_call(
        &mut self,
        mac: &Macro,
        args: &[Vec<CppToken>],
        hide: &mut Vec<String>,
    ) -> Vec<CppToken> {
        let named = mac.params.len();
        let varargs: Vec<CppToken> = if mac.is_variadic && args.len() > named {
            let mut out = Vec::new();
            for (k, arg) in args[named..].iter().enumerate() {
                if k > 0 {
                    out.push(CppToken::Punct(","));
                }
                out.extend(macros::trim_spaces(arg).iter().cloned());
            }
            out
        } else {
            Vec::new()
        };

        fn arg_of<'a>(args: &'a [Vec<CppToken>], idx: usize) -> &'a [CppToken] {
            args.get(idx).map(|a| a.as_slice()).unwrap_or(&[])
        }

        let body = &mac.body;
        let mut out: Vec<CppToken> = Vec::new();
        let mut i = 0;
        while i < body.len() {
            let t = &body[i];
            match t {
                // '#param' stringizes the raw argument.
                CppToken::Sharp => {
                    let mut j = i + 1;
                    while body.get(j).map(|t| t.is_space()).unwrap_or(false) {
                        j += 1;
                    }
                    match body.get(j) {
                        Some(CppToken::Identifier(p)) if mac.param_index(p).is_some() => {
                            let idx = mac.param_index(p).unwrap();
                            out.push(macros::stringize(arg_of(args, idx)));
                            i = j + 1;
                        }
                        Some(CppToken::Identifier(p))
                            if mac.is_variadic && p == "__VA_ARGS__" =>
                        {
                            out.push(macros::stringize(&varargs));
                            i = j + 1;
                        }
                        _ => {
                            out.push(t.clone());
                            i += 1;
                        }
                    }
                }
                CppToken::Identifier(p) => {
                    let next_is_paste = next_nonspace_is_paste(body, i + 1);
                    let prev_is_paste = out
                        .iter()
                        .rev()
                        .find(|t| !t.is_space())
                        .map(|t| *t == CppToken::DoubleSharp)
                        .unwrap_or(false);
                    if let Some(idx) = mac.param_index(p) {
                        if next_is_paste || prev_is_paste {
                            // Paste operands use the raw argument.
                            out.extend(macros::trim_spaces(arg_of(args, idx)).iter().cloned());
                        } else {
                            let expanded =
                                self.expand_list(arg_of(args, idx).to_vec(), hide);
                            out.extend(expanded);
                        }
                    } else if mac.is_variadic && p == "__VA_ARGS__" {
                        if next_is_paste || prev_is_paste {
                            out.extend(varargs.iter().cloned());
                        } else {
                            let expanded = self.expand_list(varargs.clone(), hide);
                            out.extend(expanded);
                        }
                    } else {
                        out.push(t.clone());
                    }
                    i += 1;
                }
                other => {
                    out.push(other.clone());
                    i += 1;
                }
            }
        }
        apply_pastes(out)
    }
}

fn next_nonspace_is_paste(body: &[CppToken], from: usize) -> bool {
    body.iter()
        .skip(from)
        .find(|t| !t.is_space())
        .map(|t| *t == CppToken::DoubleSharp)
        .unwrap_or(false)
}

/// Applies `##` pastes over a substituted body.
fn apply_pastes(tokens: Vec<CppToken>) -> Vec<CppToken> {
    if !tokens.iter().any(|t| *t == CppToken::DoubleSharp) {
        return tokens;
    }
    let mut out: Vec<CppToken> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == CppToken::DoubleSharp {
            // Trim back to the previous significant token.
            while out.last().map(|t| t.is_space()).unwrap_or(false) {
                out.pop();
            }
            let mut j = i + 1;
            while tokens.get(j).map(|t| t.is_space()).unwrap_or(false) {
                j += 1;
            }
            match (out.pop(), tokens.get(j)) {
                (Some(left), Some(right)) => {
                    out.push(macros::paste(&left, right));
                    i = j + 1;
                }
                (left, _) => {
                    if let Some(left) = left {
                        out.push(left);
                    }
                    i += 1;
                }
            }
        } else {
            out.push(tokens[i].clone());
            i += 1;
        }
    }
    out
}

/// Arity check for a function-like macro call.
///
/// An empty parenthesis pair is zero arguments for a zero-parameter macro
/// and one empty argument otherwise.
fn arity_matches(mac: &Macro, args: &[Vec<CppToken>]) -> bool {
    let named = mac.params.len();
    let effective = if args.len() == 1
        && macros::trim_spaces(&args[0]).is_empty()
        && named == 0
        && !mac.is_variadic
    {
        0
    } else {
        args.len()
    };
    if mac.is_variadic {
        effective >= named
    } else {
        effective == named
    }
}

/// Parses a macro parameter list starting right after `(`. Returns the
/// parameter names, whether it is variadic, and the body offset relative
/// to the slice start.
fn parse_macro_params(tokens: &[CppToken]) -> Option<(Vec<String>, bool, usize)> {
    let mut params = Vec::new();
    let mut is_variadic = false;
    let mut i = 0;
    let mut expect_name = true;
    loop {
        let t = tokens.get(i)?;
        if t.is_space() {
            i += 1;
            continue;
        }
        if t.is_punct(")") {
            if expect_name && !params.is_empty() {
                return None;
            }
            return Some((params, is_variadic, i + 1));
        }
        if is_variadic {
            // Nothing may follow '...'.
            return None;
        }
        match t {
            CppToken::Identifier(name) if expect_name => {
                params.push(name.clone());
                expect_name = false;
            }
            CppToken::Punct("...") if expect_name || params.is_empty() => {
                is_variadic = true;
                expect_name = false;
            }
            CppToken::Punct(",") if !expect_name => {
                expect_name = true;
            }
            CppToken::Punct("...") if !expect_name => {
                // GNU named variadics: `args...`.
                is_variadic = true;
            }
            _ => return None,
        }
        i += 1;
    }
}

/// Matches the `!defined(GUARD)` opening form of an include guard;
/// anything else (extra clauses, nesting) is not canonical.
fn parse_not_defined(tokens: &[CppToken]) -> Option<String> {
    let sig: Vec<&CppToken> = tokens.iter().filter(|t| !t.is_space()).collect();
    if sig.len() == 5
        && sig[0].is_punct("!")
        && sig[1].is_ident("defined")
        && sig[2].is_punct("(")
        && sig[4].is_punct(")")
    {
        if let CppToken::Identifier(name) = sig[3] {
            return Some(name.clone());
        }
    }
    None
}

/// Parses an include target out of directive tokens: `"path"` or
/// `<path>`.
fn parse_include_target(tokens: &[CppToken]) -> Option<(String, char)> {
    let tokens = macros::trim_spaces(tokens);
    match tokens.first()? {
        CppToken::Str(s) => {
            if s.is_empty() {
                return None;
            }
            Some((s.clone(), '"'))
        }
        t if t.is_punct("<") => {
            let mut path = String::new();
            for tok in &tokens[1..] {
                if tok.is_punct(">") {
                    if path.is_empty() {
                        return None;
                    }
                    return Some((path, '<'));
                }
                path.push_str(&tok.spelling());
            }
            None
        }
        _ => None,
    }
}
