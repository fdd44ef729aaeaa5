// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`CoreTool`]: an [`anvil_recipe::AbstractTool`] template instantiated against a concrete
//! package's environment, plus the lazy user-facing [`Tool`] view.

use indexmap::IndexMap;

use anvil_recipe::FingerprintIf;

use crate::core_ref::CoreRef;

/// A tool as produced by one package's `provideTools`, substituted against that package's env.
/// Identity for digest purposes is the step it came from ([`CoreTool::package_step`]); `path`/
/// `libs` participate in the Variant-Id, `environment`/`fingerprint_script` only in the Result-Id.
#[derive(Debug, Clone)]
pub struct CoreTool {
    /// The package step this tool's path/libs are rooted at.
    pub package_step: CoreRef,
    pub path: String,
    pub libs: Vec<String>,
    pub net_access: bool,
    pub environment: IndexMap<String, String>,
    pub fingerprint_script: Option<String>,
    pub fingerprint_if: FingerprintIf,
}

/// User-facing view of a [`CoreTool`], produced by [`crate::deref::deref_package`].
#[derive(Debug, Clone)]
pub struct Tool {
    pub path: String,
    pub libs: Vec<String>,
    pub net_access: bool,
    pub environment: IndexMap<String, String>,
    pub fingerprint_script: Option<String>,
}

impl From<&CoreTool> for Tool {
    fn from(core: &CoreTool) -> Self {
        Tool {
            path: core.path.clone(),
            libs: core.libs.clone(),
            net_access: core.net_access,
            environment: core.environment.clone(),
            fingerprint_script: core.fingerprint_script.clone(),
        }
    }
}
