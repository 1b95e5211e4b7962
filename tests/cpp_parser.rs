use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use remcc::cpp::{
    CompilerInfo, CppParser, CppToken, ErrorObserver, IncludeObserver, MacroEnvCache,
};

mod util;

use util::init;

/// Test include observer mirroring the scanner's production contract: it
/// resolves paths from an in-memory map, consults the processed-file check
/// first, and counts reads and skips per path.
struct TestIncludeObserver {
    includes: HashMap<String, String>,
    skipped: HashMap<String, usize>,
    included: HashMap<String, usize>,
}

impl TestIncludeObserver {
    fn new() -> Rc<RefCell<TestIncludeObserver>> {
        Rc::new(RefCell::new(TestIncludeObserver {
            includes: HashMap::new(),
            skipped: HashMap::new(),
            included: HashMap::new(),
        }))
    }
}

impl TestIncludeObserver {
    fn set_include(&mut self, path: &str, content: &str) {
        self.includes.insert(path.to_string(), content.to_string());
    }

    fn skip_count(&self, path: &str) -> usize {
        self.skipped.get(path).copied().unwrap_or(0)
    }

    fn included_count(&self, path: &str) -> usize {
        self.included.get(path).copied().unwrap_or(0)
    }
}

impl IncludeObserver for TestIncludeObserver {
    fn handle_include(
        &mut self,
        parser: &mut CppParser,
        path: &str,
        _current_directory: &str,
        _current_filepath: &str,
        _quote_char: char,
        include_dir_index: usize,
    ) -> bool {
        if parser.is_processed_file(path, include_dir_index) {
            *self.skipped.entry(path.to_string()).or_insert(0) += 1;
            return true;
        }
        let Some(content) = self.includes.get(path).cloned() else {
            return false;
        };
        *self.included.entry(path.to_string()).or_insert(0) += 1;
        parser.add_string_input_at(&content, path, include_dir_index);
        true
    }

    fn has_include(
        &mut self,
        path: &str,
        _current_directory: &str,
        _current_filepath: &str,
        _quote_char: char,
        _include_dir_index: usize,
    ) -> bool {
        self.includes.contains_key(path)
    }
}

struct TestErrorObserver {
    errors: Vec<String>,
}

impl TestErrorObserver {
    fn new() -> Rc<RefCell<TestErrorObserver>> {
        Rc::new(RefCell::new(TestErrorObserver { errors: Vec::new() }))
    }
}

impl ErrorObserver for TestErrorObserver {
    fn handle_error(&mut self, error: &str) {
        self.errors.push(error.to_string());
    }
}

#[test]
fn tokenize_define_string() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input("#define KOTORI \"piyo\\\"piyo\"", "(string)");

    assert_eq!(parser.next_token(true), CppToken::Sharp);
    assert_eq!(
        parser.next_token(true),
        CppToken::Identifier("define".to_string())
    );
    assert_eq!(
        parser.next_token(true),
        CppToken::Identifier("KOTORI".to_string())
    );
    assert_eq!(
        parser.next_token(true),
        CppToken::Str("piyo\\\"piyo".to_string())
    );
    assert_eq!(parser.next_token(true), CppToken::End);
}

#[test]
fn empty_include_reports_one_error() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input("#include\n", "(string)");
    let errors = TestErrorObserver::new();
    parser.set_error_observer(errors.clone());
    parser.process_directives();
    let errors = errors.borrow();
    assert_eq!(errors.errors.len(), 1);
    assert_eq!(
        errors.errors[0],
        "CppParser((string):2) #include expects \"filename\" or <filename>"
    );
}

#[test]
fn empty_has_include_reports_errors() {
    init();
    let mut parser = CppParser::new();
    parser.enable_predefined_macro("__has_include");
    parser.add_string_input(
        "#if __has_include()\n#endif\n#if __has_include(\n#endif\n#if __has_include",
        "(string)",
    );
    let errors = TestErrorObserver::new();
    parser.set_error_observer(errors.clone());
    parser.process_directives();
    let errors = errors.borrow();
    assert_eq!(errors.errors.len(), 3);
    assert_eq!(
        errors.errors[0],
        "CppParser((string):2) __has_include expects \"filename\" or <filename>"
    );
    assert_eq!(
        errors.errors[1],
        "CppParser((string):4) __has_include expects \"filename\" or <filename>"
    );
    assert_eq!(
        errors.errors[2],
        "CppParser((string):5) macro is referred without any arguments:__has_include"
    );
}

#[test]
fn has_feature_side_table_values() {
    init();
    let mut info = CompilerInfo::default();
    for name in [
        "__has_feature",
        "__has_extension",
        "__has_attribute",
        "__has_cpp_attribute",
        "__has_declspec_attribute",
        "__has_builtin",
    ] {
        info.supported_predefined_macros.insert(name.to_string());
    }
    info.has_feature.insert("feature".to_string(), 2);
    info.has_extension.insert("extension".to_string(), 3);
    info.has_attribute.insert("attribute".to_string(), 4);
    info.has_cpp_attribute.insert("cpp_attribute".to_string(), 5);
    info.has_cpp_attribute.insert("ns::attr".to_string(), 6);
    info.has_builtin.insert("builtin".to_string(), 7);

    let mut parser = CppParser::new();
    parser.set_compiler_info(info);
    parser.add_string_input(
        concat!(
            "#if __has_feature(feature) == 2\n#define ok_feature\n#endif\n",
            "#if __has_extension(extension) == 3\n#define ok_extension\n#endif\n",
            "#if __has_attribute(attribute) == 4\n#define ok_attribute\n#endif\n",
            "#if __has_cpp_attribute(cpp_attribute) == 5\n#define ok_cpp\n#endif\n",
            "#if __has_cpp_attribute(ns::attr) == 6\n#define ok_ns\n#endif\n",
            "#if __has_builtin(builtin) == 7\n#define ok_builtin\n#endif\n",
            "#if __has_feature(unknown)\n#define bad_unknown\n#endif\n",
        ),
        "(string)",
    );
    parser.process_directives();
    for name in [
        "ok_feature",
        "ok_extension",
        "ok_attribute",
        "ok_cpp",
        "ok_ns",
        "ok_builtin",
    ] {
        assert!(parser.is_macro_defined(name), "{} not defined", name);
    }
    assert!(!parser.is_macro_defined("bad_unknown"));
}

#[test]
fn has_include_consults_observer() {
    init();
    let mut parser = CppParser::new();
    parser.enable_predefined_macro("__has_include");
    let observer = TestIncludeObserver::new();
    observer.borrow_mut().set_include("exists.h", "");
    parser.set_include_observer(observer);
    parser.add_string_input(
        concat!(
            "#if __has_include(<exists.h>)\n#define have_it\n#endif\n",
            "#if __has_include(\"missing.h\")\n#define have_missing\n#endif\n",
        ),
        "(string)",
    );
    parser.process_directives();
    assert!(parser.is_macro_defined("have_it"));
    assert!(!parser.is_macro_defined("have_missing"));
}

#[test]
fn macro_arity_mismatches_report_expected_lines() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input(
        "#define M() 1\n#if M()\n#endif\n#if M(x)\n#endif\n#define M1(x) x\n#if M1()\n#endif\n#if M1(1)\n#endif\n#define M2(x,y) x+y\n#if M2(1,1)\n#endif\n#if M2(,1)\n#endif\n#if M2(1,)\n#endif\n#if M2()\n#endif\n#if M2(1)\n#endif\n#if M2(1,,1)\n#endif\n",
        "(string)",
    );
    let errors = TestErrorObserver::new();
    parser.set_error_observer(errors.clone());
    parser.process_directives();
    let errors = errors.borrow();
    let expect =
        "macro argument number mismatching with the parameter list";
    assert_eq!(errors.errors.len(), 4);
    assert_eq!(errors.errors[0], format!("CppParser((string):5) {}", expect));
    assert_eq!(errors.errors[1], format!("CppParser((string):19) {}", expect));
    assert_eq!(errors.errors[2], format!("CppParser((string):21) {}", expect));
    assert_eq!(errors.errors[3], format!("CppParser((string):23) {}", expect));
}

#[test]
fn include_more_than_once_without_guard() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer
        .borrow_mut()
        .set_include("foo.h", "#ifdef hoge\n#endif\n");
    parser.set_include_observer(observer.clone());
    parser.add_string_input(
        "#define hoge\n#include <foo.h>\n#undef hoge\n#include <foo.h>\n",
        "foo.cc",
    );
    parser.process_directives();
    assert_eq!(parser.total_files(), 2);
    assert_eq!(parser.skipped_files(), 0);
    assert_eq!(observer.borrow().included_count("foo.h"), 2);
}

#[test]
fn import_processes_only_once() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer
        .borrow_mut()
        .set_include("foo.h", "#ifdef hoge\n#endif\n");
    parser.set_include_observer(observer.clone());
    parser.add_string_input(
        "#define hoge\n#import <foo.h>\n#undef hoge\n#import <foo.h>\n",
        "foo.cc",
    );
    parser.process_directives();
    assert_eq!(parser.total_files(), 2);
    assert_eq!(parser.skipped_files(), 1);
    assert_eq!(observer.borrow().included_count("foo.h"), 1);
}

#[test]
fn bool_keywords_in_cplusplus_mode() {
    init();
    let mut parser = CppParser::new();
    parser.set_is_cplusplus(true);
    parser.add_string_input(
        "#if true\n#define foo\n#endif\n#if false\n#define bar\n#endif\n",
        "baz.cc",
    );
    parser.process_directives();
    assert!(parser.is_macro_defined("foo"));
    assert!(!parser.is_macro_defined("bar"));
}

#[test]
fn bool_keywords_in_c_mode_evaluate_to_zero() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input(
        "#if true\n#define foo\n#endif\n#if false\n#define bar\n#endif\n",
        "baz.c",
    );
    parser.process_directives();
    assert!(!parser.is_macro_defined("foo"));
    assert!(!parser.is_macro_defined("bar"));
}

#[test]
fn bool_keywords_are_not_defined_macros() {
    init();
    let mut parser = CppParser::new();
    parser.set_is_cplusplus(true);
    parser.add_string_input(
        concat!(
            "#if true\n#define foo\n#endif\n",
            "#if defined(true)\n#define bar\n#endif\n",
            "#if false\n#define baz\n#endif\n",
            "#if defined(false)\n#define qux\n#endif\n",
        ),
        "baz.cc",
    );
    parser.process_directives();
    assert!(parser.is_macro_defined("foo"));
    assert!(!parser.is_macro_defined("bar"));
    assert!(!parser.is_macro_defined("baz"));
    assert!(!parser.is_macro_defined("qux"));
}

#[test]
fn user_macro_overrides_bool_keyword() {
    init();
    let mut parser = CppParser::new();
    parser.set_is_cplusplus(true);
    parser.add_string_input(
        "#define true 0\n#if true\n#define foo\n#endif\n#undef true\n#if true\n#define bar\n#endif\n",
        "baz.cc",
    );
    parser.process_directives();
    assert!(!parser.is_macro_defined("foo"));
    assert!(parser.is_macro_defined("bar"));
}

#[test]
fn include_guards_suppress_rereads() {
    init();
    // Scenario: c.h includes b.h includes a.h; the top level then
    // re-includes b.h and a.h directly.
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    {
        let mut obs = observer.borrow_mut();
        obs.set_include(
            "a.h",
            "#ifndef A_H\n#define A_H\nint a;\n#endif\n",
        );
        obs.set_include(
            "b.h",
            "#ifndef B_H\n#define B_H\n#include \"a.h\"\nint b;\n#endif\n",
        );
        obs.set_include(
            "c.h",
            "#ifndef C_H\n#define C_H\n#include \"b.h\"\nint c;\n#endif\n",
        );
    }
    parser.set_include_observer(observer.clone());
    parser.add_string_input(
        "#include \"c.h\"\n#include \"b.h\"\n#include \"a.h\"\n",
        "top.cc",
    );
    parser.process_directives();

    let obs = observer.borrow();
    assert_eq!(obs.included_count("a.h"), 1);
    assert_eq!(obs.included_count("b.h"), 1);
    assert_eq!(obs.included_count("c.h"), 1);
    assert_eq!(obs.skip_count("a.h"), 1);
    assert_eq!(obs.skip_count("b.h"), 1);
    assert_eq!(obs.skip_count("c.h"), 0);
    assert_eq!(parser.skipped_files(), 2);
}

#[test]
fn if_not_defined_guard_form_is_detected() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer.borrow_mut().set_include(
        "a.h",
        "#if !defined(A_H)\n#define A_H\nint a;\n#endif\n",
    );
    parser.set_include_observer(observer.clone());
    parser.add_string_input("#include \"a.h\"\n#include \"a.h\"\n", "top.cc");
    parser.process_directives();
    let obs = observer.borrow();
    assert_eq!(obs.included_count("a.h"), 1);
    assert_eq!(obs.skip_count("a.h"), 1);
}

#[test]
fn non_trivial_condition_disables_guard() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer.borrow_mut().set_include(
        "a.h",
        "#if !defined(A_H) || defined(FORCE)\n#define A_H\nint a;\n#endif\n",
    );
    parser.set_include_observer(observer.clone());
    parser.add_string_input("#include \"a.h\"\n#include \"a.h\"\n", "top.cc");
    parser.process_directives();
    let obs = observer.borrow();
    assert_eq!(obs.included_count("a.h"), 2);
    assert_eq!(obs.skip_count("a.h"), 0);
}

#[test]
fn content_outside_guard_disables_guard() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer.borrow_mut().set_include(
        "a.h",
        "#ifndef A_H\n#define A_H\nint a;\n#endif\nint outside;\n",
    );
    parser.set_include_observer(observer.clone());
    parser.add_string_input("#include \"a.h\"\n#include \"a.h\"\n", "top.cc");
    parser.process_directives();
    let obs = observer.borrow();
    assert_eq!(obs.included_count("a.h"), 2);
    assert_eq!(obs.skip_count("a.h"), 0);
}

#[test]
fn guard_without_define_is_not_a_guard() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer
        .borrow_mut()
        .set_include("a.h", "#ifndef A_H\nint a;\n#endif\n");
    parser.set_include_observer(observer.clone());
    parser.add_string_input("#include \"a.h\"\n#include \"a.h\"\n", "top.cc");
    parser.process_directives();
    let obs = observer.borrow();
    assert_eq!(obs.included_count("a.h"), 2);
    assert_eq!(obs.skip_count("a.h"), 0);
}

#[test]
fn undefined_guard_macro_forces_reread() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer.borrow_mut().set_include(
        "a.h",
        "#ifndef A_H\n#define A_H\nint a;\n#endif\n",
    );
    parser.set_include_observer(observer.clone());
    parser.add_string_input(
        "#include \"a.h\"\n#undef A_H\n#include \"a.h\"\n",
        "top.cc",
    );
    parser.process_directives();
    let obs = observer.borrow();
    assert_eq!(obs.included_count("a.h"), 2);
    assert_eq!(obs.skip_count("a.h"), 0);
}

#[test]
fn pragma_once_suppresses_reread() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    observer
        .borrow_mut()
        .set_include("a.h", "#pragma once\nint a;\n");
    parser.set_include_observer(observer.clone());
    parser.add_string_input("#include \"a.h\"\n#include \"a.h\"\n", "top.cc");
    parser.process_directives();
    let obs = observer.borrow();
    assert_eq!(obs.included_count("a.h"), 1);
    assert_eq!(obs.skip_count("a.h"), 1);
}

#[test]
fn digraph_percent_colon_is_sharp() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input("%:define A 1\n#if A\n#define yes\n#endif\n", "(string)");
    parser.process_directives();
    assert!(parser.is_macro_defined("A"));
    assert!(parser.is_macro_defined("yes"));
}

#[test]
fn stringize_and_paste_expand() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input(
        concat!(
            "#define STR(x) #x\n",
            "#define CAT(a, b) a ## b\n",
            "#define NAME CAT(foo, bar)\n",
        ),
        "(string)",
    );
    assert!(parser.process_directives());

    parser.add_string_input("STR(hello world) NAME", "(expand)");
    let mut tokens = Vec::new();
    loop {
        let t = parser.next_token(true);
        if t == CppToken::End {
            break;
        }
        tokens.push(t);
    }
    let expanded = parser.expand0(tokens, false);
    assert_eq!(
        expanded,
        vec![
            CppToken::Str("hello world".to_string()),
            CppToken::Identifier("foobar".to_string()),
        ]
    );
}

#[test]
fn variadic_macro_expands_va_args() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input(
        "#define FIRST(head, ...) head\n#if FIRST(1, 2, 3)\n#define picked\n#endif\n#define ALL(...) __VA_ARGS__\n#if ALL(0) + 1\n#define summed\n#endif\n",
        "(string)",
    );
    parser.process_directives();
    assert!(parser.is_macro_defined("picked"));
    assert!(parser.is_macro_defined("summed"));
}

#[test]
fn macro_does_not_expand_recursively() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input(
        "#define A B\n#define B A\n#if defined(A)\n#endif\n",
        "(string)",
    );
    assert!(parser.process_directives());

    parser.add_string_input("A", "(expand)");
    let mut tokens = Vec::new();
    loop {
        let t = parser.next_token(true);
        if t == CppToken::End {
            break;
        }
        tokens.push(t);
    }
    // A -> B -> A, where the inner A is hidden and stays literal.
    let expanded = parser.expand0(tokens, false);
    assert_eq!(expanded, vec![CppToken::Identifier("A".to_string())]);
}

#[test]
fn deep_include_chain_is_aborted() {
    init();
    let mut parser = CppParser::new();
    let observer = TestIncludeObserver::new();
    // self.h includes itself with no guard.
    observer
        .borrow_mut()
        .set_include("self.h", "#include \"self.h\"\n");
    parser.set_include_observer(observer.clone());
    let errors = TestErrorObserver::new();
    parser.set_error_observer(errors.clone());
    parser.add_string_input("#include \"self.h\"\n", "top.cc");
    assert!(!parser.process_directives());
    assert!(errors
        .borrow()
        .errors
        .iter()
        .any(|e| e.contains("include depth exceeds 1024")));
    // The runaway header was attempted over and over, not once.
    assert!(observer.borrow().included_count("self.h") >= 1000);
}

#[test]
fn macro_env_cache_reuses_scan() {
    init();
    let cache = Arc::new(MacroEnvCache::new());

    let run = |cache: &Arc<MacroEnvCache>| -> (usize, bool) {
        let mut parser = CppParser::new();
        parser.set_macro_env_cache(Arc::clone(cache));
        let observer = TestIncludeObserver::new();
        observer
            .borrow_mut()
            .set_include("foo.h", "#define FOO 1\n#undef BAR\n");
        parser.set_include_observer(observer.clone());
        parser.add_string_input("#include \"foo.h\"\n", "top.cc");
        parser.process_directives();
        let included = observer.borrow().included_count("foo.h");
        (included, parser.is_macro_defined("FOO"))
    };

    let (included_first, foo_first) = run(&cache);
    assert_eq!(included_first, 1);
    assert!(foo_first);

    // Identical incoming macro environment: the delta replays with zero
    // file reads.
    let (included_second, foo_second) = run(&cache);
    assert_eq!(included_second, 0);
    assert!(foo_second);
    assert_eq!(cache.hits(), 1);
}

#[test]
fn predefined_references_are_not_cached() {
    init();
    let cache = Arc::new(MacroEnvCache::new());

    let run = |cache: &Arc<MacroEnvCache>| -> usize {
        let mut parser = CppParser::new();
        let mut info = CompilerInfo::default();
        info.supported_predefined_macros
            .insert("__has_feature".to_string());
        info.has_feature.insert("feature".to_string(), 1);
        parser.set_compiler_info(info);
        parser.set_macro_env_cache(Arc::clone(cache));
        let observer = TestIncludeObserver::new();
        observer.borrow_mut().set_include(
            "bar.h",
            "#if __has_feature(feature)\n#define HAS 1\n#endif\n",
        );
        parser.set_include_observer(observer.clone());
        parser.add_string_input("#include \"bar.h\"\n", "top.cc");
        parser.process_directives();
        let count = observer.borrow().included_count("bar.h");
        count
    };

    assert_eq!(run(&cache), 1);
    // The side-table dependence keeps this file out of the cache.
    assert_eq!(run(&cache), 1);
    assert_eq!(cache.hits(), 0);
}

#[test]
fn elif_and_else_branches() {
    init();
    let mut parser = CppParser::new();
    parser.add_string_input(
        concat!(
            "#define V 2\n",
            "#if V == 1\n#define one\n",
            "#elif V == 2\n#define two\n",
            "#elif V == 3\n#define three\n",
            "#else\n#define other\n#endif\n",
        ),
        "(string)",
    );
    parser.process_directives();
    assert!(!parser.is_macro_defined("one"));
    assert!(parser.is_macro_defined("two"));
    assert!(!parser.is_macro_defined("three"));
    assert!(!parser.is_macro_defined("other"));
}

#[test]
fn add_macro_by_string_defines_object_macro() {
    init();
    let mut parser = CppParser::new();
    parser.add_macro_by_string("__STDC__", "1");
    parser.add_macro_by_string("__GNUC__", "9");
    parser.add_string_input(
        "#if __STDC__ && __GNUC__ >= 4\n#define modern\n#endif\n",
        "(string)",
    );
    parser.process_directives();
    assert!(parser.is_macro_defined("modern"));
}
