// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`PackageMatcher`]: memoizes an elaborated [`crate::package::CorePackage`] against the subset
//! of its inputs that actually mattered, so a later call-site with byte-equal touched inputs gets
//! back the identical instance instead of a fresh, equivalent one.

use indexmap::{IndexMap, IndexSet};

use anvil_digest::Digest;
use anvil_env::Env;

use crate::{arena::PackageId, core_ref::CoreRef, package::PluginState, toolset::ToolSet};

/// A snapshot of exactly the inputs one prior `prepare()` call touched, keyed so a future call can
/// cheaply decide whether it would produce the same package without re-running elaboration.
#[derive(Debug, Clone)]
pub struct PackageMatcher {
    pub package: PackageId,
    env: IndexMap<String, Option<String>>,
    tools: IndexMap<String, Option<Digest>>,
    states: IndexMap<String, Box<dyn PluginState>>,
    sandbox: Option<Digest>,
    /// Recipe names reachable from this package, used to re-check cycle-freedom on a memoized hit
    /// (§4.5: "on a memoized hit, if `stack ∩ subTreePackages ≠ ∅`, raise").
    pub subtree_packages: IndexSet<String>,
}

impl PackageMatcher {
    pub fn capture(
        package: PackageId,
        env: &Env,
        tools: &ToolSet,
        states: &IndexMap<String, Box<dyn PluginState>>,
        sandbox: Option<&CoreRef>,
        subtree_packages: IndexSet<String>,
    ) -> Self {
        let env = env.touched_keys().into_iter().map(|name| {
            let value = env.peek(&name).map(str::to_string);
            (name, value)
        }).collect();
        let tools = tools.touched_keys().into_iter().map(|name| {
            let variant_id = tools.peek(&name).map(|r| r.variant_id);
            (name, variant_id)
        }).collect();
        Self {
            package,
            env,
            tools,
            states: states.clone(),
            sandbox: sandbox.map(|r| r.variant_id),
            subtree_packages,
        }
    }

    /// Whether `(env, tools, states, sandbox)` would produce the same package as the one this
    /// matcher was captured from.
    pub fn matches(&self, env: &Env, tools: &ToolSet, states: &IndexMap<String, Box<dyn PluginState>>, sandbox: Option<&CoreRef>) -> bool {
        for (name, value) in &self.env {
            if env.peek(name).map(str::to_string).as_ref() != value.as_ref() {
                return false;
            }
        }
        for (name, variant_id) in &self.tools {
            let current = tools.peek(name).map(|r| r.variant_id);
            if &current != variant_id {
                return false;
            }
        }
        if self.sandbox != sandbox.map(|r| r.variant_id) {
            return false;
        }
        if &self.states != states {
            return false;
        }
        true
    }

    /// Record, on the caller's env/tools, that this matcher's touched names were consulted — so a
    /// memoized hit still lets the *new* caller's own matcher (captured one level up) know which
    /// inputs its result depended on.
    pub fn touch(&self, env: &Env, tools: &ToolSet) {
        for name in self.env.keys() {
            env.touch(name);
        }
        for name in self.tools.keys() {
            tools.touch(name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core_ref::CoreTarget;

    fn env_with(pairs: &[(&str, &str)]) -> Env {
        let mut env = Env::new();
        for (k, v) in pairs {
            env.set(*k, *v);
        }
        env
    }

    #[test]
    fn matches_only_on_touched_names() {
        let env = env_with(&[("A", "1"), ("B", "2")]);
        env.get("A");
        let matcher = PackageMatcher::capture(PackageId(0), &env, &ToolSet::new(), &IndexMap::new(), None, IndexSet::new());

        let same_a = env_with(&[("A", "1"), ("B", "999")]);
        assert!(matcher.matches(&same_a, &ToolSet::new(), &IndexMap::new(), None));

        let diff_a = env_with(&[("A", "2"), ("B", "2")]);
        assert!(!matcher.matches(&diff_a, &ToolSet::new(), &IndexMap::new(), None));
    }

    #[test]
    fn sandbox_mismatch_rejects() {
        let env = Env::new();
        let sandbox_a = CoreRef::leaf(CoreTarget::None, Digest::Short([1; 20]), true, true, String::new());
        let sandbox_b = CoreRef::leaf(CoreTarget::None, Digest::Short([2; 20]), true, true, String::new());
        let matcher = PackageMatcher::capture(PackageId(0), &env, &ToolSet::new(), &IndexMap::new(), Some(&sandbox_a), IndexSet::new());
        assert!(matcher.matches(&env, &ToolSet::new(), &IndexMap::new(), Some(&sandbox_a)));
        assert!(!matcher.matches(&env, &ToolSet::new(), &IndexMap::new(), Some(&sandbox_b)));
    }
}
