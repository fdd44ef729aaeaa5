// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`CoreRef`]: a handle from one call-site to a step/tool/sandbox, carrying the tool/sandbox
//! overlay accumulated along the path that reached it.
//!
//! The core graph built by [`crate::elaborate::Elaborator`] is shared: the same `CoreStep` can be
//! reached from many call-sites, each of which may see a different *effective* tool set or
//! sandbox because of `diffTools`/`diffSandbox` edits applied along the way (§4.5 step 3 of the
//! propagation algorithm). Rather than materialising one specialised copy of the step per
//! call-site, a `CoreRef` records the delta and composes it lazily at
//! [`crate::deref::deref_package`] time.

use indexmap::IndexMap;

use anvil_digest::Digest;

use crate::{
    arena::StepId,
    sandbox::CoreSandbox,
    tool::CoreTool,
};

/// What a [`CoreRef`] ultimately points at. `None` is the internal placeholder used for a step
/// that was never constructed (e.g. a recipe with no checkout script and no SCM).
#[derive(Debug, Clone)]
pub enum CoreTarget {
    Step(StepId),
    Tool(Box<CoreTool>),
    Sandbox(Box<CoreSandbox>),
    None,
}

/// How a ref's sandbox overlay should be composed against the input sandbox at deref time.
#[derive(Debug, Clone, Default)]
pub enum DiffSandbox {
    /// Use whatever the consumer passes in.
    #[default]
    Inherit,
    /// Explicitly no sandbox, regardless of what the consumer would otherwise use.
    Clear,
    /// Always use this sandbox, regardless of what the consumer would otherwise use.
    Replace(Box<CoreRef>),
}

/// A reference to a core graph node plus the tool/sandbox overlay accumulated on the path that
/// produced it.
///
/// `variant_id`/`is_valid` are cached at construction time rather than recomputed through the
/// arena on every read: once a [`crate::step::CoreStep`] is built it is never mutated, so the
/// cache can never go stale, and digest computation (which reads `variant_id` on every arg/tool
/// entry) stays a plain field access instead of an arena lookup plus borrow.
#[derive(Debug, Clone)]
pub struct CoreRef {
    pub target: CoreTarget,
    pub variant_id: Digest,
    pub is_valid: bool,
    pub deterministic: bool,
    /// Name of the recipe this ref's target ultimately traces back to, used for by-name
    /// deduplication of indirect/provided deps and for diagnostics.
    pub source_recipe: String,
    pub diff_tools: IndexMap<String, Option<CoreRef>>,
    pub diff_sandbox: DiffSandbox,
}

impl CoreRef {
    /// A ref with no overlay, as produced the first time a call-site reaches a node.
    pub fn leaf(target: CoreTarget, variant_id: Digest, is_valid: bool, deterministic: bool, source_recipe: impl Into<String>) -> Self {
        Self {
            target,
            variant_id,
            is_valid,
            deterministic,
            source_recipe: source_recipe.into(),
            diff_tools: IndexMap::new(),
            diff_sandbox: DiffSandbox::Inherit,
        }
    }

    pub fn with_overlay(mut self, diff_tools: IndexMap<String, Option<CoreRef>>, diff_sandbox: DiffSandbox) -> Self {
        self.diff_tools = diff_tools;
        self.diff_sandbox = diff_sandbox;
        self
    }

    pub fn step_id(&self) -> Option<StepId> {
        match self.target {
            CoreTarget::Step(id) => Some(id),
            _ => None,
        }
    }
}
