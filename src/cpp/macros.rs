//! Macro definitions and the token-level expansion helpers.

use super::token::{parse_int_literal, CppToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Object,
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macro {
    pub name: String,
    pub kind: MacroKind,
    pub params: Vec<String>,
    pub is_variadic: bool,
    pub body: Vec<CppToken>,
}

impl Macro {
    pub fn object(name: &str, body: Vec<CppToken>) -> Macro {
        Macro {
            name: name.to_string(),
            kind: MacroKind::Object,
            params: Vec::new(),
            is_variadic: false,
            body,
        }
    }

    pub fn function(
        name: &str,
        params: Vec<String>,
        is_variadic: bool,
        body: Vec<CppToken>,
    ) -> Macro {
        Macro {
            name: name.to_string(),
            kind: MacroKind::Function,
            params,
            is_variadic,
            body,
        }
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p == name)
    }
}

/// Joins tokens into their source spelling, preserving single spaces.
pub fn spell_tokens(tokens: &[CppToken]) -> String {
    let mut out = String::new();
    for t in tokens {
        out.push_str(&t.spelling());
    }
    out
}

/// `#arg`: the argument's spelling as a string literal token, surrounding
/// whitespace stripped and inner runs collapsed.
pub fn stringize(arg: &[CppToken]) -> CppToken {
    let trimmed = trim_spaces(arg);
    let mut text = String::new();
    let mut pending_space = false;
    for t in trimmed {
        if t.is_space() {
            pending_space = true;
            continue;
        }
        if pending_space && !text.is_empty() {
            text.push(' ');
        }
        pending_space = false;
        match t {
            // Quotes and backslashes inside string/char literals are
            // escaped in the stringized form.
            CppToken::Str(s) => {
                text.push('\\');
                text.push('"');
                text.push_str(&s.replace('\\', "\\\\"));
                text.push('\\');
                text.push('"');
            }
            other => text.push_str(&other.spelling()),
        }
    }
    CppToken::Str(text)
}

/// `a ## b`: pastes two tokens into one, re-classifying the result.
pub fn paste(left: &CppToken, right: &CppToken) -> CppToken {
    let text = format!("{}{}", left.spelling(), right.spelling());
    classify(&text)
}

/// Re-classifies pasted text as the best-fitting single token.
fn classify(text: &str) -> CppToken {
    if text.is_empty() {
        return CppToken::Space;
    }
    let first = text.as_bytes()[0];
    if first.is_ascii_digit() {
        let value = parse_int_literal(text).unwrap_or(0);
        return CppToken::Number(value, text.to_string());
    }
    if first.is_ascii_alphabetic() || first == b'_' {
        return CppToken::Identifier(text.to_string());
    }
    // Punctuator-shaped output keeps the textual form via an identifier
    // token; the evaluator treats unknown text as 0.
    CppToken::Identifier(text.to_string())
}

pub fn trim_spaces(tokens: &[CppToken]) -> &[CppToken] {
    let start = tokens.iter().position(|t| !t.is_space()).unwrap_or(tokens.len());
    let end = tokens
        .iter()
        .rposition(|t| !t.is_space())
        .map(|i| i + 1)
        .unwrap_or(start);
    &tokens[start..end]
}

/// Splits a function-macro argument list. `tokens` begins right after the
/// opening parenthesis; returns the arguments and the index one past the
/// closing parenthesis, or `None` when the list is unterminated.
pub fn split_args(tokens: &[CppToken]) -> Option<(Vec<Vec<CppToken>>, usize)> {
    let mut args = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        if t.is_punct("(") {
            depth += 1;
            current.push(t.clone());
        } else if t.is_punct(")") {
            if depth == 0 {
                args.push(current);
                return Some((args, i + 1));
            }
            depth -= 1;
            current.push(t.clone());
        } else if t.is_punct(",") && depth == 0 {
            args.push(std::mem::take(&mut current));
        } else if *t == CppToken::Newline {
            current.push(CppToken::Space);
        } else {
            current.push(t.clone());
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(s: &str) -> CppToken {
        CppToken::Identifier(s.to_string())
    }

    #[test]
    fn stringize_collapses_inner_space() {
        let arg = vec![
            CppToken::Space,
            ident("a"),
            CppToken::Space,
            CppToken::Space,
            CppToken::Punct("+"),
            ident("b"),
            CppToken::Space,
        ];
        assert_eq!(stringize(&arg), CppToken::Str("a +b".to_string()));
    }

    #[test]
    fn paste_makes_identifier_and_number() {
        assert_eq!(paste(&ident("foo"), &ident("bar")), ident("foobar"));
        assert_eq!(
            paste(
                &CppToken::Number(1, "1".to_string()),
                &CppToken::Number(2, "2".to_string())
            ),
            CppToken::Number(12, "12".to_string())
        );
    }

    #[test]
    fn split_args_handles_nesting_and_empties() {
        // M(a, (b,c), )
        let tokens = vec![
            ident("a"),
            CppToken::Punct(","),
            CppToken::Punct("("),
            ident("b"),
            CppToken::Punct(","),
            ident("c"),
            CppToken::Punct(")"),
            CppToken::Punct(","),
            CppToken::Punct(")"),
        ];
        let (args, consumed) = split_args(&tokens).unwrap();
        assert_eq!(consumed, tokens.len());
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], vec![ident("a")]);
        assert_eq!(args[1].len(), 5);
        assert!(args[2].is_empty());
    }

    #[test]
    fn unterminated_args_is_none() {
        let tokens = vec![ident("a"), CppToken::Punct(",")];
        assert!(split_args(&tokens).is_none());
    }
}
