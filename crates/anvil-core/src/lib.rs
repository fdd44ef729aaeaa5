// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! The recipe-to-package elaboration engine: turns a [`anvil_recipe::RecipeSet`] into an
//! immutable package/step graph by recursively `prepare`-ing every recipe reachable from the
//! virtual root, then exposes that graph through a lazy, per-call-site [`Package`]/[`Step`]/
//! [`Tool`]/[`Sandbox`] facade.
//!
//! Entry point: build an [`elaborate::RecipeSetContext`] over a loaded `RecipeSet`, hand it to a
//! fresh [`elaborate::Elaborator`], and call [`elaborate::Elaborator::elaborate_root`]. The
//! returned [`arena::PackageId`] plus the elaborator itself are enough to walk the whole graph —
//! either directly through [`arena::Arena`] lookups, or through [`deref::deref_package`] for the
//! overlay-composed, user-facing view.

pub mod arena;
pub mod cache;
pub mod core_ref;
pub mod deref;
pub mod diagnostics;
pub mod elaborate;
pub mod error;
pub mod matcher;
pub mod package;
pub mod sandbox;
pub mod step;
pub mod tool;
pub mod toolset;

pub use arena::{Arena, PackageId, StepId};
pub use cache::{compute_cache_key, CacheHeader, PersistedGraph, PersistedPackage, PersistedStep, CACHE_FORMAT_VERSION};
pub use core_ref::{CoreRef, CoreTarget, DiffSandbox};
pub use deref::deref_package;
pub use elaborate::{Elaborator, RecipeSetContext};
pub use error::{Error, ErrorKind, Frame, Result};
pub use matcher::PackageMatcher;
pub use package::{CorePackage, Package, PluginState};
pub use sandbox::{CoreSandbox, Sandbox};
pub use step::{CoreStep, Step};
pub use tool::{CoreTool, Tool};
pub use toolset::ToolSet;
