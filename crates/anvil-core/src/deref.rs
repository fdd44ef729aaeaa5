// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Lazy dereference of a [`CoreRef`] into the user-facing [`Package`]/[`Step`]/[`Tool`]/[`Sandbox`]
//! view (§4.5's `refDeref`).
//!
//! The core graph built by [`crate::elaborate::Elaborator`] is shared between every call-site that
//! reaches a given step, but two call-sites can disagree about which tools/sandbox are in effect
//! there because of `use: [tools], forward: true` edits applied along the path each one took to
//! get there. Rather than re-running elaboration per call-site, each [`CoreRef`] only records the
//! *delta* (`diff_tools`/`diff_sandbox`) from whatever its caller already had; this module composes
//! that delta against a caller-supplied base and materialises the result on demand.

use indexmap::IndexMap;

use crate::{
    arena::{PackageId, StepId},
    core_ref::{CoreRef, CoreTarget, DiffSandbox},
    elaborate::Elaborator,
    package::Package,
    sandbox::Sandbox,
    step::Step,
    tool::Tool,
    toolset::ToolSet,
};

/// Dereference `core_ref` (which must target a package step) into a [`Package`], composing its
/// `diff_tools`/`diff_sandbox` against `input_tools`/`input_sandbox` — the effective view the
/// *caller* already had before following this ref.
///
/// A package's own elaborated tool/sandbox table (already fully accumulated during `prepare`)
/// always wins over whatever the caller would otherwise have contributed under the same name,
/// since a package can only ever see the tools/sandbox its own `depends`/`provides` resolved to.
pub fn deref_package(core_ref: &CoreRef, elaborator: &Elaborator, input_tools: &ToolSet, input_sandbox: Option<&CoreRef>) -> Package {
    let step_id = core_ref.step_id().expect("deref_package called on a non-step CoreRef");
    let step = elaborator.steps().get(step_id.0);
    let package = elaborator.packages().get(step.package.0);

    let mut tools = compose_tools(input_tools, &core_ref.diff_tools);
    for (name, core_tool) in &package.tools {
        tools.insert(name.clone(), Tool::from(core_tool));
    }

    let composed_sandbox = compose_sandbox(input_sandbox, &core_ref.diff_sandbox);
    let sandbox = package.sandbox.as_ref().map(Sandbox::from).or(composed_sandbox);

    Package {
        recipe_name: package.recipe_name.clone(),
        checkout: deref_step(elaborator, package.checkout_step).filter(|s| s.is_valid),
        build: package.build_step.map(|id| deref_step(elaborator, id).expect("build step always present when Some")),
        package: deref_step(elaborator, step_id).expect("package step always constructed"),
        tools,
        sandbox,
    }
}

/// Dereference the package a top-level [`PackageId`] names (e.g. the virtual root returned by
/// [`crate::elaborate::Elaborator::elaborate_root`]), using its own captured overlay and starting
/// from an empty caller context.
pub fn deref_root_package(elaborator: &Elaborator, pkg_id: PackageId) -> Package {
    let package = elaborator.packages().get(pkg_id.0);
    deref_package(&package.internal_ref, elaborator, &ToolSet::new(), None)
}

fn deref_step(elaborator: &Elaborator, step_id: StepId) -> Option<Step> {
    let step = elaborator.steps().get(step_id.0);
    Some(Step {
        kind: step.kind,
        env: step.env.clone(),
        script: step.script.clone(),
        variant_id: step.variant_id,
        is_valid: step.is_valid,
        deterministic: step.deterministic,
    })
}

fn compose_tools(input_tools: &ToolSet, diff_tools: &IndexMap<String, Option<CoreRef>>) -> IndexMap<String, Tool> {
    let mut tools: IndexMap<String, Tool> = input_tools
        .iter()
        .filter_map(|(name, r)| match &r.target {
            CoreTarget::Tool(t) => Some((name.to_string(), Tool::from(t.as_ref()))),
            _ => None,
        })
        .collect();
    for (name, overlay) in diff_tools {
        match overlay {
            Some(core_ref) => match &core_ref.target {
                CoreTarget::Tool(t) => {
                    tools.insert(name.clone(), Tool::from(t.as_ref()));
                }
                _ => {}
            },
            None => {
                tools.shift_remove(name);
            }
        }
    }
    tools
}

fn compose_sandbox(input_sandbox: Option<&CoreRef>, diff_sandbox: &DiffSandbox) -> Option<Sandbox> {
    match diff_sandbox {
        DiffSandbox::Inherit => input_sandbox.and_then(as_sandbox_view),
        DiffSandbox::Clear => None,
        DiffSandbox::Replace(core_ref) => as_sandbox_view(core_ref),
    }
}

fn as_sandbox_view(core_ref: &CoreRef) -> Option<Sandbox> {
    match &core_ref.target {
        CoreTarget::Sandbox(s) => Some(Sandbox::from(s.as_ref())),
        _ => None,
    }
}
