// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`CoreSandbox`]: a package's `provideSandbox` instantiated against that package's environment,
//! plus the lazy user-facing [`Sandbox`] view.

use indexmap::IndexMap;

use anvil_recipe::MountSpec;

use crate::core_ref::CoreRef;

#[derive(Debug, Clone)]
pub struct CoreSandbox {
    /// The package step whose output is used as the sandbox filesystem root.
    pub package_step: CoreRef,
    pub enabled: bool,
    pub paths: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub environment: IndexMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub enabled: bool,
    pub paths: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub environment: IndexMap<String, String>,
}

impl From<&CoreSandbox> for Sandbox {
    fn from(core: &CoreSandbox) -> Self {
        Sandbox {
            enabled: core.enabled,
            paths: core.paths.clone(),
            mounts: core.mounts.clone(),
            environment: core.environment.clone(),
        }
    }
}
