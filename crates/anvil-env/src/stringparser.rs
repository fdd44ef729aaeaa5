// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! The `$VAR`, `${VAR:-default}`, `$(fn,arg1,arg2)` expression language used by [`Env::substitute`]
//! and [`Env::evaluate`](crate::Env::evaluate).
//!
//! Lexical tokens (identifiers, the leading `$`) are recognised with `nom`, in the spirit of
//! `stone_recipe::script`'s tokenizer. Unlike that tokenizer, this grammar nests arbitrarily
//! (defaults and function arguments may themselves contain substitutions), so the outer structure
//! is a small recursive-descent scanner that tracks delimiter balance rather than a single flat
//! `nom::multi::iterator` pass.

use nom::{
    character::complete::{alpha1, alphanumeric1, char},
    combinator::recognize,
    multi::many0_count,
    sequence::pair,
    IResult,
};
use thiserror::Error;

use crate::FunArgs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fragment {
    Literal(String),
    Var {
        name: String,
        default: Option<Default_>,
    },
    Call {
        name: String,
        args: Vec<Vec<Fragment>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Default_ {
    /// `${NAME:-text}` — used when NAME is unset.
    Minus(Vec<Fragment>),
    /// `${NAME:+text}` — used when NAME is set.
    Plus(Vec<Fragment>),
}

#[derive(Debug, Error)]
pub enum SubstError {
    #[error("{diag}: undefined variable '{name}'")]
    Undefined { diag: String, name: String },
    #[error("{diag}: unterminated '${{' (missing matching '}}')")]
    UnterminatedBrace { diag: String },
    #[error("{diag}: unterminated '$(' (missing matching ')')")]
    UnterminatedCall { diag: String },
    #[error("{diag}: empty variable name after '$'")]
    EmptyName { diag: String },
    #[error("{diag}: unknown string function '{name}'")]
    UnknownFunction { diag: String, name: String },
    #[error("{diag}: {0}", diag = .diag)]
    Function { diag: String, source: String },
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        nom::branch::alt((alpha1, nom::bytes::complete::tag("_"))),
        many0_count(nom::branch::alt((alphanumeric1, nom::bytes::complete::tag("_")))),
    ))(input)
}

/// Find the index (byte offset into `rest`) of the delimiter that closes the one already opened,
/// honouring nesting of `open`/`close` pairs that appear *inside* the span (e.g. nested `${`).
fn find_matching(rest: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut chars = rest.char_indices();
    while let Some((idx, c)) = chars.next() {
        if c == '\\' {
            chars.next();
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            if depth == 0 {
                return Some(idx);
            }
            depth -= 1;
        }
    }
    None
}

/// Split the text between `$(name,` and its closing `)` into raw argument substrings, honouring
/// paren balance and `\,` as a literal (non-separating) comma.
fn split_args(rest: &str) -> (Vec<String>, usize) {
    let mut depth = 0i32;
    let mut args = Vec::new();
    let mut current = String::new();
    let mut chars = rest.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some(&(_, next)) = chars.peek() {
                    if next == ',' {
                        current.push(',');
                        chars.next();
                        continue;
                    }
                }
                current.push('\\');
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                if depth == 0 {
                    if !current.is_empty() || !args.is_empty() {
                        args.push(current);
                    }
                    return (args, idx);
                }
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                args.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    // Unterminated; caller reports the error.
    args.push(current);
    (args, rest.len())
}

pub(crate) fn parse(input: &str, diag: &str) -> Result<Vec<Fragment>, SubstError> {
    parse_until(input, diag).map(|(frags, rest)| {
        debug_assert!(rest.is_empty());
        frags
    })
}

/// Parse fragments from the start of `input` until end-of-string, returning the remaining
/// (always empty at top level) text for symmetry with the recursive helper.
fn parse_until<'a>(input: &'a str, diag: &str) -> Result<(Vec<Fragment>, &'a str), SubstError> {
    let mut frags = Vec::new();
    let mut rest = input;
    loop {
        match rest.find('$') {
            None => {
                if !rest.is_empty() {
                    frags.push(Fragment::Literal(rest.to_string()));
                }
                return Ok((frags, ""));
            }
            Some(0) => {
                let (frag, tail) = parse_dollar(rest, diag)?;
                if let Some(frag) = frag {
                    frags.push(frag);
                }
                rest = tail;
            }
            Some(idx) => {
                frags.push(Fragment::Literal(rest[..idx].to_string()));
                rest = &rest[idx..];
            }
        }
    }
}

/// Parse one `$...` form at the start of `rest` (which starts with `$`). Returns the produced
/// fragment (`None` for the `$$` escape, which contributes a literal handled by the caller
/// collapsing it into the literal run) and the remaining text.
fn parse_dollar<'a>(rest: &'a str, diag: &str) -> Result<(Option<Fragment>, &'a str), SubstError> {
    let after_dollar = &rest[1..];
    let mut chars = after_dollar.chars();
    match chars.next() {
        Some('$') => Ok((Some(Fragment::Literal("$".to_string())), &after_dollar[1..])),
        Some('{') => {
            let body = &after_dollar[1..];
            let end = find_matching(body, '{', '}')
                .ok_or_else(|| SubstError::UnterminatedBrace { diag: diag.to_string() })?;
            let inner = &body[..end];
            let tail = &body[end + 1..];
            let frag = parse_braced_var(inner, diag)?;
            Ok((Some(frag), tail))
        }
        Some('(') => {
            let body = &after_dollar[1..];
            // name runs up to the first top-level ',' or the closing ')'
            let (name, name_len) = identifier(body)
                .map(|(r, n)| (n, body.len() - r.len()))
                .map_err(|_| SubstError::EmptyName { diag: diag.to_string() })?;
            let after_name = &body[name_len..];
            let (raw_args, consumed) = match after_name.strip_prefix(',') {
                Some(tail) => {
                    let (args, consumed) = split_args(tail);
                    (args, name_len + 1 + consumed)
                }
                None => {
                    if after_name.starts_with(')') {
                        (Vec::new(), name_len)
                    } else {
                        return Err(SubstError::UnterminatedCall { diag: diag.to_string() });
                    }
                }
            };
            // consumed currently points at ')' relative to body for the no-arg case too
            let close_idx = if raw_args.is_empty() && !after_name.is_empty() && after_name.starts_with(')') {
                name_len
            } else {
                consumed
            };
            if !body[close_idx..].starts_with(')') {
                return Err(SubstError::UnterminatedCall { diag: diag.to_string() });
            }
            let tail = &body[close_idx + 1..];
            let mut args = Vec::with_capacity(raw_args.len());
            for raw in raw_args {
                args.push(parse(&raw, diag)?);
            }
            Ok((
                Some(Fragment::Call {
                    name: name.to_string(),
                    args,
                }),
                tail,
            ))
        }
        Some(c) if c.is_alphabetic() || c == '_' => {
            let (tail, name) = identifier(after_dollar)
                .map_err(|_| SubstError::EmptyName { diag: diag.to_string() })?;
            Ok((
                Some(Fragment::Var {
                    name: name.to_string(),
                    default: None,
                }),
                tail,
            ))
        }
        _ => Err(SubstError::EmptyName { diag: diag.to_string() }),
    }
}

fn parse_braced_var(inner: &str, diag: &str) -> Result<Fragment, SubstError> {
    let (name, rest) = identifier(inner).map_err(|_| SubstError::EmptyName { diag: diag.to_string() })?;
    if rest.is_empty() {
        return Ok(Fragment::Var {
            name: name.to_string(),
            default: None,
        });
    }
    let default = if let Some(text) = rest.strip_prefix(":-") {
        Some(Default_::Minus(parse(text, diag)?))
    } else if let Some(text) = rest.strip_prefix(":+") {
        Some(Default_::Plus(parse(text, diag)?))
    } else {
        return Err(SubstError::EmptyName { diag: diag.to_string() });
    };
    Ok(Fragment::Var {
        name: name.to_string(),
        default,
    })
}

/// Evaluate a single `$VAR`/`${...}`/`$(fn,...)` fragment tree against a lookup callback (so
/// `Env` can record touches) and a function table.
pub(crate) fn eval(
    frags: &[Fragment],
    diag: &str,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
    call_fun: &mut dyn FnMut(&str, &[String], &FunArgs) -> Option<Result<String, String>>,
    fun_args: &FunArgs,
) -> Result<String, SubstError> {
    let mut out = String::new();
    for frag in frags {
        match frag {
            Fragment::Literal(s) => out.push_str(s),
            Fragment::Var { name, default } => match (lookup(name), default) {
                (Some(v), Some(Default_::Plus(alt))) => {
                    out.push_str(&eval(alt, diag, lookup, call_fun, fun_args)?);
                    let _ = v;
                }
                (Some(v), _) => out.push_str(&v),
                (None, Some(Default_::Minus(def))) => {
                    out.push_str(&eval(def, diag, lookup, call_fun, fun_args)?)
                }
                (None, Some(Default_::Plus(_))) => {}
                (None, None) => {
                    return Err(SubstError::Undefined {
                        diag: diag.to_string(),
                        name: name.clone(),
                    })
                }
            },
            Fragment::Call { name, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(eval(arg, diag, lookup, call_fun, fun_args)?);
                }
                match call_fun(name, &evaluated, fun_args) {
                    Some(Ok(v)) => out.push_str(&v),
                    Some(Err(e)) => {
                        return Err(SubstError::Function {
                            diag: diag.to_string(),
                            source: e,
                        })
                    }
                    None => {
                        return Err(SubstError::UnknownFunction {
                            diag: diag.to_string(),
                            name: name.clone(),
                        })
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Interpret a substituted string as a boolean per `evaluate`'s rules: empty, `0`, or `false`
/// (case-insensitive) are false, everything else is true.
pub fn truthy(s: &str) -> bool {
    !matches!(s, "" | "0") && !s.eq_ignore_ascii_case("false")
}

#[cfg(test)]
mod test {
    use super::*;

    fn lookup_map(map: &std::collections::HashMap<&str, &str>) -> impl FnMut(&str) -> Option<String> + '_ {
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn plain_var() {
        let map = std::collections::HashMap::from([("FOO", "bar")]);
        let frags = parse("prefix $FOO suffix", "test").unwrap();
        let mut lookup = lookup_map(&map);
        let mut call = |_: &str, _: &[String], _: &FunArgs| None;
        let out = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap();
        assert_eq!(out, "prefix bar suffix");
    }

    #[test]
    fn braced_default_minus() {
        let map = std::collections::HashMap::new();
        let frags = parse("${FOO:-fallback}", "test").unwrap();
        let mut lookup = lookup_map(&map);
        let mut call = |_: &str, _: &[String], _: &FunArgs| None;
        let out = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn braced_default_plus() {
        let map = std::collections::HashMap::from([("FOO", "set")]);
        let frags = parse("${FOO:+alt}", "test").unwrap();
        let mut lookup = lookup_map(&map);
        let mut call = |_: &str, _: &[String], _: &FunArgs| None;
        let out = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap();
        assert_eq!(out, "alt");
    }

    #[test]
    fn undefined_is_error() {
        let map = std::collections::HashMap::new();
        let frags = parse("$FOO", "test").unwrap();
        let mut lookup = lookup_map(&map);
        let mut call = |_: &str, _: &[String], _: &FunArgs| None;
        let err = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap_err();
        assert!(matches!(err, SubstError::Undefined { .. }));
    }

    #[test]
    fn escaped_dollar() {
        let frags = parse("$$5", "test").unwrap();
        let map = std::collections::HashMap::new();
        let mut lookup = lookup_map(&map);
        let mut call = |_: &str, _: &[String], _: &FunArgs| None;
        let out = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap();
        assert_eq!(out, "$5");
    }

    #[test]
    fn function_call_with_args() {
        let map = std::collections::HashMap::from([("A", "1"), ("B", "2")]);
        let frags = parse("$(eq,$A,$B)", "test").unwrap();
        let mut lookup = lookup_map(&map);
        let mut call = |name: &str, args: &[String], _: &FunArgs| {
            if name == "eq" {
                Some(Ok(if args[0] == args[1] { "true" } else { "false" }.to_string()))
            } else {
                None
            }
        };
        let out = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap();
        assert_eq!(out, "false");
    }

    #[test]
    fn escaped_comma_in_args() {
        let frags = parse(r"$(id,a\,b,c)", "test").unwrap();
        let map = std::collections::HashMap::new();
        let mut lookup = lookup_map(&map);
        let mut call = |name: &str, args: &[String], _: &FunArgs| {
            if name == "id" {
                Some(Ok(args.join("|")))
            } else {
                None
            }
        };
        let out = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap();
        assert_eq!(out, "a,b|c");
    }

    #[test]
    fn nested_call_in_default() {
        let map = std::collections::HashMap::from([("B", "bee")]);
        let frags = parse("${A:-$B}", "test").unwrap();
        let mut lookup = lookup_map(&map);
        let mut call = |_: &str, _: &[String], _: &FunArgs| None;
        let out = eval(&frags, "test", &mut lookup, &mut call, &FunArgs::default()).unwrap();
        assert_eq!(out, "bee");
    }

    #[test]
    fn truthy_rules() {
        assert!(!truthy(""));
        assert!(!truthy("0"));
        assert!(!truthy("false"));
        assert!(!truthy("False"));
        assert!(truthy("1"));
        assert!(truthy("anything"));
    }
}
