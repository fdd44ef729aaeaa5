// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`CorePackage`]: one elaborated instantiation of a recipe, plus the user-facing [`Package`]
//! view and the pluggable [`PluginState`] extension point.

use std::fmt;

use indexmap::IndexMap;

use crate::{
    arena::{PackageId, StepId},
    core_ref::CoreRef,
    sandbox::Sandbox,
    step::Step,
    tool::Tool,
};

/// Extension point for a plugin-contributed `use: [<plugin-state-name>]` value (spec §3's
/// "per-plugin typed properties"/"plugin state"). Plugin *execution* is out of scope; this trait
/// is the seam a host process would implement against. `states` equality and propagation are the
/// only things the elaborator itself needs to know how to do.
pub trait PluginState: fmt::Debug {
    /// Called when a dependency declares `use: [<this state's name>]`; folds the dependency's
    /// state into `self`.
    fn on_use(&mut self, child: &dyn PluginState);
    fn state_eq(&self, other: &dyn PluginState) -> bool;
    fn clone_state(&self) -> Box<dyn PluginState>;
}

impl Clone for Box<dyn PluginState> {
    fn clone(&self) -> Self {
        self.clone_state()
    }
}

impl PartialEq for Box<dyn PluginState> {
    fn eq(&self, other: &Self) -> bool {
        self.state_eq(other.as_ref())
    }
}

/// One elaborated instantiation of a recipe. Immutable once returned from `prepare`; two
/// call-sites whose `PackageMatcher` keys agree share the same `CorePackage` (by `pkg_id`).
#[derive(Debug, Clone)]
pub struct CorePackage {
    pub pkg_id: PackageId,
    pub recipe_name: String,
    pub tools: IndexMap<String, crate::tool::CoreTool>,
    pub sandbox: Option<crate::sandbox::CoreSandbox>,
    pub direct_dep_steps: Vec<CoreRef>,
    pub indirect_dep_steps: Vec<CoreRef>,
    pub states: IndexMap<String, Box<dyn PluginState>>,
    /// Bit `i` set means tool `i` (sorted by name) contributes to the fingerprint; an extra high
    /// bit represents the recipe's own fingerprint script.
    pub fingerprint_mask: u64,
    pub checkout_step: StepId,
    pub build_step: Option<StepId>,
    pub package_step: StepId,
    /// Ref to this package's own package step, carrying the `diff_tools`/`diff_sandbox` overlay
    /// captured at the call-site that first constructed it.
    pub internal_ref: CoreRef,
}

/// Lazily-instantiated user-facing view of a [`CorePackage`], produced by
/// [`crate::deref::deref_package`]. Holds fully composed (overlay-applied) tools/sandbox rather
/// than the raw package-level ones.
#[derive(Debug, Clone)]
pub struct Package {
    pub recipe_name: String,
    pub checkout: Option<Step>,
    pub build: Option<Step>,
    pub package: Step,
    pub tools: IndexMap<String, Tool>,
    pub sandbox: Option<Sandbox>,
}
