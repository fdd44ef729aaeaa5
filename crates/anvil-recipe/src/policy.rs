// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Project-wide policy flags. Each one changes a piece of class-resolution or elaboration
//! behaviour; all default to whatever a project declaring no `bobMinimumVersion` would have
//! gotten historically, so an old project that never touches `config.yaml` keeps old semantics.

use serde::Deserialize;

/// Toggles gated by `bobMinimumVersion`/`layerMinimumVersion` in `config.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Policies {
    /// Keep per-class environment dicts as an ordered layer list, applied parent-to-child at
    /// elaboration time, instead of flattening them into one child-overrides-parent dict during
    /// class resolution.
    pub merge_environment: bool,
    /// Force `relocatable = true` regardless of whether the recipe provides tools.
    pub all_relocatable: bool,
    /// When a dependency is declared more than once under different override environments but
    /// the same recipe name: `true` errors, `false` warns once per (caller, dependency) and keeps
    /// the first occurrence.
    pub unique_dependency: bool,
    /// Require every recipe with a non-trivial sandbox to be deterministic.
    pub sandbox_invariant: bool,
    /// Disallow any upstream fetch; checkouts must resolve entirely from local caches.
    pub offline_build: bool,
    /// Resolve `$<'path'>`/`$<<path>>` includes relative to the including recipe's directory
    /// rather than the project root.
    pub relative_includes: bool,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            merge_environment: false,
            all_relocatable: false,
            unique_dependency: true,
            sandbox_invariant: false,
            offline_build: false,
            relative_includes: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_legacy_semantics() {
        let policies = Policies::default();
        assert!(!policies.merge_environment);
        assert!(!policies.all_relocatable);
        assert!(policies.unique_dependency);
    }

    #[test]
    fn parses_from_yaml_with_partial_overrides() {
        let policies: Policies = serde_yaml::from_str("allRelocatable: true\n").unwrap();
        assert!(policies.all_relocatable);
        assert!(!policies.merge_environment);
    }
}
