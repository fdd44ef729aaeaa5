// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Resolves the `$<'path'>` (inline, shell-quoted) and `$<<path>>` (materialised-to-file) forms
//! that let a script embed the contents of another file without listing it as a dependency of
//! the step that runs the script. Every byte pulled in this way is folded into a digest so two
//! scripts that differ only in an included file still produce different step digests.

use std::fmt;

use thiserror::Error;

/// Abstracts reading file contents so `IncludeHelper` can be exercised with an in-memory fixture
/// in tests instead of touching the real filesystem.
pub trait FileLoader {
    /// Resolve `pattern` (glob syntax: `*`/`?`/`[...]`) to every matching path, relative to
    /// whatever root the loader was constructed with, in no particular order (the caller sorts).
    /// A literal pattern with no metacharacters matches at most the one file of that name.
    fn glob(&self, pattern: &str) -> std::io::Result<Vec<String>>;

    /// Read the full contents of `path`, relative to whatever root the loader was constructed
    /// with.
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;

    /// Write `content` out to a real filesystem path that a script's `$<<path>>` expansion can
    /// reference directly, e.g. a content-addressed temp file.
    fn materialize(&self, content: &[u8]) -> std::io::Result<String>;
}

#[derive(Debug, Error)]
pub enum IncludeHelperError {
    #[error("include '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("unterminated include form starting at byte {offset}")]
    Unterminated { offset: usize },
    #[error("include path must not be empty (at byte {offset})")]
    EmptyPath { offset: usize },
    #[error("include pattern '{pattern}' matched no files")]
    NoMatches { pattern: String },
}

/// Shell-quote `s` the way POSIX `sh` single-quoting requires: wrap in `'...'`, escaping any
/// embedded `'` as `'\''`.
fn shell_quote(s: &[u8]) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for &b in s {
        if b == b'\'' {
            out.push_str("'\\''");
        } else {
            out.push(b as char);
        }
    }
    out.push('\'');
    out
}

/// Resolves `$<'path'>`/`$<<path>>` forms in a script body, tracking every file pulled in so its
/// bytes can be folded into the owning step's digest.
pub struct IncludeHelper<'a> {
    loader: &'a dyn FileLoader,
    included: Vec<(String, Vec<u8>)>,
}

impl<'a> fmt::Debug for IncludeHelper<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncludeHelper")
            .field("included", &self.included.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}

impl<'a> IncludeHelper<'a> {
    pub fn new(loader: &'a dyn FileLoader) -> Self {
        Self {
            loader,
            included: Vec::new(),
        }
    }

    /// Expand every `$<'path'>`/`$<<path>>` form in `script`, returning the expanded text. Plain
    /// `$VAR` forms are left untouched for [`crate::Env::substitute`] to handle afterwards.
    pub fn process(&mut self, script: &str) -> Result<String, IncludeHelperError> {
        let mut out = String::with_capacity(script.len());
        let bytes = script.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'<') {
                if bytes.get(i + 2) == Some(&b'\'') {
                    let (path, consumed) = scan_quoted(&script[i + 3..], i)?;
                    let content = self.load(&path)?;
                    out.push_str(&shell_quote(&content));
                    i += 3 + consumed;
                    continue;
                } else if bytes.get(i + 2) == Some(&b'<') {
                    let (path, consumed) = scan_double_angle(&script[i + 3..], i)?;
                    let content = self.load(&path)?;
                    let materialized = self
                        .loader
                        .materialize(&content)
                        .map_err(|source| IncludeHelperError::Io { path: path.clone(), source })?;
                    out.push_str(&materialized);
                    i += 3 + consumed;
                    continue;
                }
            }
            let ch_len = script[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            out.push_str(&script[i..i + ch_len]);
            i += ch_len;
        }
        Ok(out)
    }

    /// Resolve `pattern` against the loader, sorted-concatenating the content of every match (the
    /// glob may name more than one file), and record the pattern/content pair for
    /// `fingerprint_into`. A pattern matching nothing is an error rather than silently expanding
    /// to nothing.
    fn load(&mut self, pattern: &str) -> Result<Vec<u8>, IncludeHelperError> {
        let mut matches = self
            .loader
            .glob(pattern)
            .map_err(|source| IncludeHelperError::Io { path: pattern.to_string(), source })?;
        if matches.is_empty() {
            return Err(IncludeHelperError::NoMatches { pattern: pattern.to_string() });
        }
        matches.sort();

        let mut content = Vec::new();
        for matched in &matches {
            let bytes = self
                .loader
                .read(matched)
                .map_err(|source| IncludeHelperError::Io { path: matched.clone(), source })?;
            content.extend_from_slice(&bytes);
        }
        self.included.push((pattern.to_string(), content.clone()));
        Ok(content)
    }

    /// The files pulled in so far, in the order they were first referenced.
    pub fn included_paths(&self) -> impl Iterator<Item = &str> {
        self.included.iter().map(|(p, _)| p.as_str())
    }

    /// Fold every included file's path and content into `hasher` (in reference order), so the
    /// owning step's digest changes if an included file's content changes.
    pub fn fingerprint_into(&self, hasher: &mut anvil_digest::DigestHasher) {
        for (path, content) in &self.included {
            hasher.write_str_framed(path);
            hasher.write_framed(content);
        }
    }
}

/// Scan `rest` (the text following `$<'`) for the closing `'>`, returning the enclosed path and
/// the number of bytes consumed from `rest` including the terminator.
fn scan_quoted(rest: &str, offset: usize) -> Result<(String, usize), IncludeHelperError> {
    match rest.find("'>") {
        Some(idx) => {
            if idx == 0 {
                return Err(IncludeHelperError::EmptyPath { offset });
            }
            Ok((rest[..idx].to_string(), idx + 2))
        }
        None => Err(IncludeHelperError::Unterminated { offset }),
    }
}

/// Scan `rest` (the text following `$<<`) for the closing `>>`.
fn scan_double_angle(rest: &str, offset: usize) -> Result<(String, usize), IncludeHelperError> {
    match rest.find(">>") {
        Some(idx) => {
            if idx == 0 {
                return Err(IncludeHelperError::EmptyPath { offset });
            }
            Ok((rest[..idx].to_string(), idx + 2))
        }
        None => Err(IncludeHelperError::Unterminated { offset }),
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, collections::HashMap};

    use super::*;

    struct FixtureLoader {
        files: HashMap<String, Vec<u8>>,
        materialized: RefCell<Vec<Vec<u8>>>,
    }

    impl FileLoader for FixtureLoader {
        fn glob(&self, pattern: &str) -> std::io::Result<Vec<String>> {
            let matcher = globset::Glob::new(pattern)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?
                .compile_matcher();
            Ok(self.files.keys().filter(|p| matcher.is_match(p.as_str())).cloned().collect())
        }

        fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        }

        fn materialize(&self, content: &[u8]) -> std::io::Result<String> {
            self.materialized.borrow_mut().push(content.to_vec());
            let digest = anvil_digest::Digest::Short(anvil_digest::sha1_bytes(content));
            Ok(format!("/tmp/anvil-include/{}", digest.to_hex()))
        }
    }

    fn loader() -> FixtureLoader {
        FixtureLoader {
            files: HashMap::from([
                ("patches/fix.patch".to_string(), b"diff --git a/x b/x\n".to_vec()),
                ("scripts/big.sh".to_string(), b"#!/bin/sh\necho hi\n".to_vec()),
            ]),
            materialized: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn inline_form_shell_quotes_content() {
        let loader = loader();
        let mut helper = IncludeHelper::new(&loader);
        let out = helper.process("apply $<'patches/fix.patch'>").unwrap();
        assert_eq!(out, "apply 'diff --git a/x b/x\n'");
    }

    #[test]
    fn file_form_substitutes_materialized_path() {
        let loader = loader();
        let mut helper = IncludeHelper::new(&loader);
        let out = helper.process("sh $<<scripts/big.sh>>").unwrap();
        let digest = anvil_digest::Digest::Short(anvil_digest::sha1_bytes(b"#!/bin/sh\necho hi\n"));
        assert_eq!(out, format!("sh /tmp/anvil-include/{}", digest.to_hex()));
    }

    #[test]
    fn glob_pattern_concatenates_sorted_matches() {
        let mut loader = loader();
        loader.files.insert("patches/a.patch".to_string(), b"first\n".to_vec());
        loader.files.insert("patches/z.patch".to_string(), b"last\n".to_vec());
        let mut helper = IncludeHelper::new(&loader);
        let out = helper.process("apply $<'patches/*.patch'>").unwrap();
        // fix.patch < a.patch < z.patch lexicographically? sorted() gives a.patch, fix.patch, z.patch
        assert_eq!(out, "apply 'first\ndiff --git a/x b/x\nlast\n'");
    }

    #[test]
    fn empty_glob_match_is_an_error() {
        let loader = loader();
        let mut helper = IncludeHelper::new(&loader);
        let err = helper.process("$<'patches/*.missing'>").unwrap_err();
        assert!(matches!(err, IncludeHelperError::NoMatches { .. }));
    }

    #[test]
    fn records_included_paths_in_order() {
        let loader = loader();
        let mut helper = IncludeHelper::new(&loader);
        helper.process("$<'patches/fix.patch'> $<<scripts/big.sh>>").unwrap();
        let paths: Vec<&str> = helper.included_paths().collect();
        assert_eq!(paths, vec!["patches/fix.patch", "scripts/big.sh"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let loader = loader();
        let mut helper = IncludeHelper::new(&loader);
        let err = helper.process("$<'nope'>").unwrap_err();
        assert!(matches!(err, IncludeHelperError::NoMatches { .. }));
    }

    #[test]
    fn unterminated_form_is_an_error() {
        let loader = loader();
        let mut helper = IncludeHelper::new(&loader);
        let err = helper.process("$<'patches/fix.patch").unwrap_err();
        assert!(matches!(err, IncludeHelperError::Unterminated { .. }));
    }

    #[test]
    fn untouched_dollar_forms_pass_through() {
        let loader = loader();
        let mut helper = IncludeHelper::new(&loader);
        let out = helper.process("echo $NAME").unwrap();
        assert_eq!(out, "echo $NAME");
    }

    #[test]
    fn fingerprint_changes_with_included_content() {
        let loader = loader();
        let mut a = IncludeHelper::new(&loader);
        a.process("$<'patches/fix.patch'>").unwrap();
        let mut h1 = anvil_digest::DigestHasher::new();
        a.fingerprint_into(&mut h1);
        let d1 = h1.finish();

        let mut b = IncludeHelper::new(&loader);
        b.process("$<<scripts/big.sh>>").unwrap();
        let mut h2 = anvil_digest::DigestHasher::new();
        b.fingerprint_into(&mut h2);
        let d2 = h2.finish();

        assert_ne!(d1.as_bytes(), d2.as_bytes());
    }
}
