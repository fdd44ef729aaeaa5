// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe/class parsing, `multiPackage` expansion, class-inheritance resolution, and the layered
//! `RecipeSet` that loads a project tree and hands `anvil-core` a ready-to-elaborate recipe map.

pub mod layer;
pub mod policy;
pub mod recipe;
pub mod recipe_set;
pub mod resolve;
pub mod schema;

pub use layer::{ConfigYaml, LayerError, LoadedConfig, load_layered_config};
pub use policy::Policies;
pub use recipe::Recipe;
pub use recipe_set::{RecipeSet, RecipeSetError, SourceTree, VIRTUAL_ROOT_NAME};
pub use resolve::{resolve_classes, ResolveError};
pub use schema::{
    AbstractTool, ClassFragment, Dependency, FingerprintIf, FingerprintScript, GlobList, KeyValue, MountSpec,
    PerStep, Provides, SandboxTemplate, ScmEntry, StepKind, UseKind, STEP_KINDS,
};
