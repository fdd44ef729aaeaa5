// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! The fully-resolved [`Recipe`]: a [`crate::schema::ClassFragment`] chain collapsed by
//! [`crate::resolve::resolve_classes`] into the read-only shape the elaborator consumes.

use indexmap::{IndexMap, IndexSet};

use crate::schema::{
    AbstractTool, Dependency, FingerprintScript, GlobList, PerStep, SandboxTemplate, ScmEntry, StepKind,
};

/// A parsed, class-resolved recipe. Built once by [`crate::resolve::resolve_classes`] and never
/// mutated again — every reader sees the same merged view.
#[derive(Debug, Clone)]
pub struct Recipe {
    /// Fully-qualified name: directory path under `recipes/`, joined by `::`.
    pub name: String,
    /// The name shared by every sibling produced from one `multiPackage` document.
    pub base_name: String,
    /// Names of classes that contributed to this recipe, in merge order, for diagnostics.
    pub classes_applied: Vec<String>,

    pub depends: Vec<Dependency>,

    pub env_filter: GlobList,
    pub tools_filter: GlobList,
    pub sandbox_filter: GlobList,

    /// Environment layers to apply at elaboration time, parent-to-child. Has more than one entry
    /// only when `Policies::merge_environment` is enabled; otherwise holds a single, already
    /// child-overrides-parent-merged map.
    pub private_environment: Vec<IndexMap<String, String>>,
    pub self_environment: Vec<IndexMap<String, String>>,
    pub meta_environment: IndexMap<String, String>,

    pub vars: PerStep<IndexSet<String>>,
    pub vars_weak: PerStep<IndexSet<String>>,
    pub tools: PerStep<IndexSet<String>>,

    pub provided_env: IndexMap<String, String>,
    pub provided_tools: IndexMap<String, AbstractTool>,
    /// Glob patterns resolved against `depends` names into concrete dependency names.
    pub provide_deps: Vec<String>,
    pub provided_sandbox: Option<SandboxTemplate>,

    /// `None` means the step has no script anywhere in the class chain (only possible for
    /// checkout/build; the package step is always defaulted to `Some(String::new())`).
    pub scripts: PerStep<Option<String>>,
    pub digest_scripts: PerStep<Option<String>>,

    pub checkout_scm: Vec<ScmEntry>,
    pub checkout_asserts: Vec<String>,
    pub checkout_deterministic: bool,

    pub root: bool,
    pub shared: bool,
    pub relocatable: bool,
    pub build_net_access: bool,
    pub package_net_access: bool,

    pub fingerprint_scripts: Vec<FingerprintScript>,

    pub plugin_properties: IndexMap<String, serde_yaml::Value>,
}

impl Recipe {
    pub fn script(&self, kind: StepKind) -> Option<&str> {
        self.scripts.get(kind).as_deref()
    }

    pub fn digest_script(&self, kind: StepKind) -> Option<&str> {
        self.digest_scripts.get(kind).as_deref()
    }

    /// A step has a real script (as opposed to being entirely absent) when its script is present
    /// and non-empty, or it is the package step (always considered valid per the data-model
    /// invariant).
    pub fn step_is_valid(&self, kind: StepKind) -> bool {
        match kind {
            StepKind::Package => true,
            _ => self.scripts.get(kind).as_deref().is_some_and(|s| !s.is_empty()) || !self.checkout_scm.is_empty() && matches!(kind, StepKind::Checkout),
        }
    }
}
