// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Scoped environment variables, with insertion order preserved and reads tracked so the
//! elaborator can later tell whether two packages built with different environments actually
//! depended on the parts that differ.
//!
//! An [`Env`] is derived from a parent with [`Env::derive`]; derived environments share a single
//! "touched" set with every other environment in the same derive family until [`Env::touch_reset`]
//! detaches a fresh one. This mirrors the way one `prepare()` call accumulates touches across many
//! nested environments but a *new* `prepare()` call must start counting from zero.

use std::{cell::RefCell, fmt, rc::Rc};

use globset::{Glob, GlobSetBuilder};
use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

mod include;
mod stringparser;

pub use include::{FileLoader, IncludeHelper, IncludeHelperError};
pub use stringparser::{truthy, SubstError};

/// Values a string function may need beyond its arguments: the recipe name currently being
/// elaborated, whether a sandbox is active, and which tools are available. Builtins like
/// `is-sandbox-enabled` and `is-tool` read this; user-registered functions may ignore it.
#[derive(Debug, Clone, Default)]
pub struct FunArgs {
    pub recipe_name: Option<String>,
    pub sandbox_enabled: bool,
    pub tool_names: IndexSet<String>,
}

pub type StringFun = Rc<dyn Fn(&[String], &FunArgs) -> Result<String, String>>;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error(transparent)]
    Subst(#[from] SubstError),
    #[error("bad glob pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// A scoped, insertion-ordered string environment.
///
/// Cloning an `Env` (via [`Env::derive`]) is cheap: variables are a flat copy (there is no parent
/// chain to walk on lookup) while the touched-name bookkeeping is shared through an `Rc` so that
/// touches recorded by a deeply derived child are visible to every ancestor in the same family.
#[derive(Clone)]
pub struct Env {
    vars: IndexMap<String, String>,
    touched: Rc<RefCell<IndexSet<String>>>,
    funs: Rc<RefCell<IndexMap<String, StringFun>>>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env").field("vars", &self.vars).finish_non_exhaustive()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// An empty environment with no touches recorded yet and only the builtin functions
    /// registered.
    pub fn new() -> Self {
        let mut env = Self {
            vars: IndexMap::new(),
            touched: Rc::new(RefCell::new(IndexSet::new())),
            funs: Rc::new(RefCell::new(IndexMap::new())),
        };
        register_builtins(&mut env);
        env
    }

    /// Derive a child environment. The child starts with the same variables as `self` and shares
    /// its touched-set family, so touches made through the child are visible via
    /// [`Env::touched_keys`] on `self` too.
    pub fn derive(&self) -> Self {
        Self {
            vars: self.vars.clone(),
            touched: Rc::clone(&self.touched),
            funs: Rc::clone(&self.funs),
        }
    }

    /// Derive a child environment, applying `overrides` on top of it (each entry calls
    /// [`Env::set`]). Overridden names are not implicitly touched.
    pub fn derive_with<I, K, V>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut child = self.derive();
        for (k, v) in overrides {
            child.set(k.into(), v.into());
        }
        child
    }

    /// Set a variable, inserting at the end if new or updating in place if it already exists
    /// (insertion order of existing keys is preserved, matching `IndexMap::insert` semantics).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Remove a variable.
    pub fn unset(&mut self, name: &str) {
        self.vars.shift_remove(name);
    }

    /// Merge `other`'s variables into `self`, overwriting on conflict, preserving `self`'s
    /// existing key order and appending any new keys from `other` in `other`'s order.
    pub fn update(&mut self, other: &Env) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Read a variable without recording a touch. Used internally by callers that already know
    /// the name is relevant (e.g. re-reading a value just written).
    pub fn peek(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Read a variable, recording the read in the shared touched-set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.touch(name);
        self.vars.get(name).map(String::as_str)
    }

    /// Record that `name` was consulted, whether or not it is actually set. Matching Python bob's
    /// behaviour, an attempted-but-missing lookup still counts as a touch: two recipes that both
    /// tried (and failed) to read the same unset variable should still be considered
    /// interchangeable for matcher purposes, not incomparable.
    pub fn touch(&self, name: &str) {
        self.touched.borrow_mut().insert(name.to_string());
    }

    /// The set of variable names touched so far in this environment's derive family, in the
    /// order they were first touched.
    pub fn touched_keys(&self) -> Vec<String> {
        self.touched.borrow().iter().cloned().collect()
    }

    /// Detach from the current touched-set family, starting a fresh, empty one. Used at the start
    /// of each top-level elaboration so unrelated `prepare()` invocations don't pollute each
    /// other's touch accounting.
    pub fn touch_reset(&mut self) {
        self.touched = Rc::new(RefCell::new(IndexSet::new()));
    }

    /// Keep only variables whose name matches one of `patterns` (glob syntax, `*`/`?`/`[...]`).
    /// An empty pattern list keeps nothing.
    pub fn filter(&self, patterns: &[String]) -> Result<Env, EnvError> {
        let set = build_globset(patterns)?;
        let vars = self.vars.iter().filter(|(k, _)| set.is_match(k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(Env {
            vars,
            touched: Rc::clone(&self.touched),
            funs: Rc::clone(&self.funs),
        })
    }

    /// Drop every variable whose name matches one of `patterns`.
    pub fn prune(&self, patterns: &[String]) -> Result<Env, EnvError> {
        let set = build_globset(patterns)?;
        let vars = self.vars.iter().filter(|(k, _)| !set.is_match(k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(Env {
            vars,
            touched: Rc::clone(&self.touched),
            funs: Rc::clone(&self.funs),
        })
    }

    /// A detached copy: same variables, but its own fresh touched-set family (no ongoing
    /// ancestor is affected by subsequent touches). Used when snapshotting an `Env` into a
    /// `CoreStep`/`CorePackage` for later comparison.
    pub fn snapshot(&self) -> Env {
        Env {
            vars: self.vars.clone(),
            touched: Rc::new(RefCell::new(self.touched.borrow().clone())),
            funs: Rc::clone(&self.funs),
        }
    }

    /// All variables in insertion order, without recording a touch on any of them.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Register a string function callable as `$(name,arg1,arg2,...)`. Overrides any builtin or
    /// previously registered function of the same name for every environment in this family
    /// (functions are shared, like touches).
    pub fn register_fun(&self, name: impl Into<String>, fun: StringFun) {
        self.funs.borrow_mut().insert(name.into(), fun);
    }

    /// Substitute `$VAR`/`${VAR:-default}`/`$(fn,args)` forms in `text`, touching every variable
    /// name referenced (whether or not it was set). `diag` labels the source of `text` in error
    /// messages (e.g. a recipe name and field).
    pub fn substitute(&self, text: &str, diag: &str) -> Result<String, EnvError> {
        self.substitute_with(text, diag, &FunArgs::default())
    }

    /// As [`Env::substitute`], but makes `fun_args` available to string functions.
    pub fn substitute_with(&self, text: &str, diag: &str, fun_args: &FunArgs) -> Result<String, EnvError> {
        let frags = stringparser::parse(text, diag)?;
        let vars = &self.vars;
        let touched = &self.touched;
        let funs = &self.funs;
        let mut lookup = |name: &str| {
            touched.borrow_mut().insert(name.to_string());
            vars.get(name).cloned()
        };
        let mut call = |name: &str, args: &[String], fun_args: &FunArgs| -> Option<Result<String, String>> {
            let fun = funs.borrow().get(name).cloned();
            fun.map(|f| f(args, fun_args))
        };
        Ok(stringparser::eval(&frags, diag, &mut lookup, &mut call, fun_args)?)
    }

    /// Substitute then interpret the result as a boolean per [`truthy`]. Used for `when`/`export`
    /// style conditional fields.
    pub fn evaluate(&self, text: &str, diag: &str) -> Result<bool, EnvError> {
        Ok(truthy(&self.substitute(text, diag)?))
    }

    /// As [`Env::evaluate`], but makes `fun_args` available to string functions (e.g.
    /// `is-sandbox-enabled`, `is-tool`).
    pub fn evaluate_with(&self, text: &str, diag: &str, fun_args: &FunArgs) -> Result<bool, EnvError> {
        Ok(truthy(&self.substitute_with(text, diag, fun_args)?))
    }
}

fn build_globset(patterns: &[String]) -> Result<globset::GlobSet, EnvError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| EnvError::Glob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| EnvError::Glob {
        pattern: patterns.join(","),
        source,
    })
}

fn register_builtins(env: &mut Env) {
    env.register_fun("and", Rc::new(|args, _| Ok(bool_str(args.iter().all(|a| truthy(a))))));
    env.register_fun("or", Rc::new(|args, _| Ok(bool_str(args.iter().any(|a| truthy(a))))));
    env.register_fun("not", Rc::new(|args, _| {
        let arg = args.first().ok_or_else(|| "not: expects 1 argument".to_string())?;
        Ok(bool_str(!truthy(arg)))
    }));
    env.register_fun("eq", Rc::new(|args, _| {
        if args.len() != 2 {
            return Err("eq: expects 2 arguments".to_string());
        }
        Ok(bool_str(args[0] == args[1]))
    }));
    env.register_fun("if-then-else", Rc::new(|args, _| {
        if args.len() != 3 {
            return Err("if-then-else: expects 3 arguments".to_string());
        }
        Ok(if truthy(&args[0]) { args[1].clone() } else { args[2].clone() })
    }));
    env.register_fun("match", Rc::new(|args, _| {
        if args.len() != 2 {
            return Err("match: expects 2 arguments (value, pattern)".to_string());
        }
        let glob = Glob::new(&args[1]).map_err(|e| format!("match: bad pattern '{}': {e}", args[1]))?;
        Ok(bool_str(glob.compile_matcher().is_match(&args[0])))
    }));
    env.register_fun("is-sandbox-enabled", Rc::new(|_, fun_args| Ok(bool_str(fun_args.sandbox_enabled))));
    env.register_fun("is-tool", Rc::new(|args, fun_args| {
        let name = args.first().ok_or_else(|| "is-tool: expects 1 argument".to_string())?;
        Ok(bool_str(fun_args.tool_names.contains(name.as_str())))
    }));
}

fn bool_str(b: bool) -> String {
    if b { "true".to_string() } else { "false".to_string() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derive_shares_touched_family() {
        let root = Env::new();
        let child = root.derive();
        child.touch("FOO");
        assert_eq!(root.touched_keys(), vec!["FOO".to_string()]);
    }

    #[test]
    fn touch_reset_detaches() {
        let mut root = Env::new();
        let child = root.derive();
        child.touch("FOO");
        root.touch_reset();
        assert!(root.touched_keys().is_empty());
        // the old family (still referenced by `child`) kept its touch.
        assert_eq!(child.touched_keys(), vec!["FOO".to_string()]);
    }

    #[test]
    fn get_touches_even_when_unset() {
        let env = Env::new();
        assert_eq!(env.get("MISSING"), None);
        assert_eq!(env.touched_keys(), vec!["MISSING".to_string()]);
    }

    #[test]
    fn set_preserves_insertion_order() {
        let mut env = Env::new();
        env.set("B", "2");
        env.set("A", "1");
        env.set("B", "20");
        let names: Vec<&str> = env.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn filter_keeps_matching_only() {
        let mut env = Env::new();
        env.set("PATH", "/bin");
        env.set("PATH_EXTRA", "/opt");
        env.set("HOME", "/root");
        let filtered = env.filter(&["PATH*".to_string()]).unwrap();
        let names: Vec<&str> = filtered.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["PATH", "PATH_EXTRA"]);
    }

    #[test]
    fn prune_drops_matching() {
        let mut env = Env::new();
        env.set("PATH", "/bin");
        env.set("HOME", "/root");
        let pruned = env.prune(&["PATH".to_string()]).unwrap();
        let names: Vec<&str> = pruned.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["HOME"]);
    }

    #[test]
    fn substitute_resolves_vars_and_touches() {
        let mut env = Env::new();
        env.set("NAME", "world");
        let out = env.substitute("hello $NAME", "greeting").unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(env.touched_keys(), vec!["NAME".to_string()]);
    }

    #[test]
    fn evaluate_interprets_truthiness() {
        let mut env = Env::new();
        env.set("FLAG", "1");
        assert!(env.evaluate("$FLAG", "flag").unwrap());
        env.set("FLAG", "false");
        assert!(!env.evaluate("$FLAG", "flag").unwrap());
    }

    #[test]
    fn builtin_if_then_else() {
        let mut env = Env::new();
        env.set("COND", "true");
        let out = env.substitute("$(if-then-else,$COND,yes,no)", "test").unwrap();
        assert_eq!(out, "yes");
    }

    #[test]
    fn builtin_is_tool_sees_fun_args() {
        let mut env = Env::new();
        let mut tools = IndexSet::new();
        tools.insert("gcc".to_string());
        let fun_args = FunArgs {
            recipe_name: Some("demo".to_string()),
            sandbox_enabled: false,
            tool_names: tools,
        };
        env.set("T", "gcc");
        let out = env.substitute_with("$(is-tool,$T)", "test", &fun_args).unwrap();
        assert_eq!(out, "true");
    }

    #[test]
    fn register_fun_is_visible_across_family() {
        let root = Env::new();
        root.register_fun("shout", Rc::new(|args, _| Ok(args[0].to_uppercase())));
        let child = root.derive();
        let out = child.substitute("$(shout,hi)", "test").unwrap();
        assert_eq!(out, "HI");
    }
}
