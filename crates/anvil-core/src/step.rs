// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`CoreStep`]: one of a package's checkout/build/package steps, immutable once constructed, plus
//! the Variant-Id/Result-Id digest protocol from the data model.

use indexmap::IndexMap;

use anvil_digest::{Digest, DigestHasher};
use anvil_recipe::StepKind;

use crate::{arena::PackageId, core_ref::CoreRef, sandbox::CoreSandbox, tool::CoreTool};

/// One checkout/build/package step. Everything here is set once by
/// [`crate::elaborate::Elaborator::prepare`] and never mutated again.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub kind: StepKind,
    pub package: PackageId,
    /// Strong vars only; the only env that participates in `variant_id`.
    pub digest_env: IndexMap<String, String>,
    /// Strong + weak vars; the env the script actually runs with.
    pub env: IndexMap<String, String>,
    pub script: Option<String>,
    pub digest_script: Option<String>,
    /// Upstream steps this one depends on (e.g. `[checkout]` for build, `[build]` for package).
    pub args: Vec<CoreRef>,
    /// Tools visible to this step specifically (its own `{checkout,build,package}Tools` subset).
    pub tools: IndexMap<String, CoreTool>,
    pub sandbox: Option<CoreSandbox>,
    /// Only ever populated on the package step.
    pub provided_env: IndexMap<String, String>,
    pub provided_tools: IndexMap<String, CoreTool>,
    pub provided_deps: Vec<CoreRef>,
    pub provided_sandbox: Option<CoreSandbox>,
    pub variant_id: Digest,
    pub result_id: Digest,
    pub deterministic: bool,
    /// `false` when the step has no script anywhere in the class chain (only possible for
    /// checkout/build; the package step is always valid).
    pub is_valid: bool,
}

/// Inputs needed to compute a step's Variant-Id (§3 of the data model).
pub struct VariantIdInputs<'a> {
    pub fingerprinted: bool,
    pub sandbox: Option<&'a CoreSandbox>,
    pub digest_script: Option<&'a str>,
    pub tools: &'a IndexMap<String, CoreTool>,
    pub digest_env: &'a IndexMap<String, String>,
    pub args: &'a [CoreRef],
}

/// Compute a Variant-Id: a SHA1 over the sandbox contribution, the digest script, the sorted tool
/// table (path/libs only — never env/fingerprint, those belong to the Result-Id), the sorted
/// digest env, and the valid args' own digests.
pub fn compute_variant_id(inputs: &VariantIdInputs) -> Digest {
    let mut hasher = DigestHasher::new();

    if inputs.fingerprinted {
        if let Some(sandbox) = inputs.sandbox {
            hasher.fingerprint(sandbox.package_step.variant_id.recipe_slice());
        }
    }

    match inputs.sandbox {
        Some(sandbox) => {
            hasher.update(sandbox.package_step.variant_id.recipe_slice());
            hasher.write_u32(sandbox.paths.len() as u32);
            for path in &sandbox.paths {
                hasher.write_str_framed(path);
            }
        }
        None => hasher.update(&[0u8; anvil_digest::HASH_LEN]),
    }

    hasher.write_str_framed(inputs.digest_script.unwrap_or(""));

    let mut sorted_tools: Vec<(&String, &CoreTool)> = inputs.tools.iter().collect();
    sorted_tools.sort_by(|a, b| a.0.cmp(b.0));
    hasher.write_u32(sorted_tools.len() as u32);
    for (_, tool) in sorted_tools {
        hasher.update(tool.package_step.variant_id.recipe_slice());
        hasher.write_u32(tool.path.len() as u32);
        hasher.write_u32(tool.libs.len() as u32);
        hasher.update(tool.path.as_bytes());
        for lib in &tool.libs {
            hasher.write_str_framed(lib);
        }
    }

    let mut sorted_env: Vec<(&String, &String)> = inputs.digest_env.iter().collect();
    sorted_env.sort_by(|a, b| a.0.cmp(b.0));
    hasher.write_u32(sorted_env.len() as u32);
    for (k, v) in sorted_env {
        hasher.write_str_framed(k);
        hasher.write_str_framed(v);
    }

    let valid_args: Vec<&CoreRef> = inputs.args.iter().filter(|a| a.is_valid).collect();
    hasher.write_u32(valid_args.len() as u32);
    for arg in valid_args {
        hasher.update(arg.variant_id.recipe_slice());
        if let Some(host) = arg.variant_id.host_slice() {
            hasher.fingerprint(&host);
        }
    }

    hasher.finish()
}

/// Extend a step's Variant-Id bytes into its Result-Id: `providedEnv`, full `providedTools`
/// (including env/fingerprint this time), `providedDeps`' variant-ids, and `providedSandbox`
/// paths/mounts/env.
pub fn compute_result_id(
    variant_id: Digest,
    provided_env: &IndexMap<String, String>,
    provided_tools: &IndexMap<String, CoreTool>,
    provided_deps: &[CoreRef],
    provided_sandbox: Option<&CoreSandbox>,
) -> Digest {
    let mut hasher = DigestHasher::new();
    hasher.update(variant_id.recipe_slice());
    if let Some(host) = variant_id.host_slice() {
        hasher.fingerprint(&host);
    }

    let mut sorted_env: Vec<(&String, &String)> = provided_env.iter().collect();
    sorted_env.sort_by(|a, b| a.0.cmp(b.0));
    hasher.write_u32(sorted_env.len() as u32);
    for (k, v) in sorted_env {
        hasher.write_str_framed(k);
        hasher.write_str_framed(v);
    }

    let mut sorted_tools: Vec<(&String, &CoreTool)> = provided_tools.iter().collect();
    sorted_tools.sort_by(|a, b| a.0.cmp(b.0));
    hasher.write_u32(sorted_tools.len() as u32);
    for (name, tool) in sorted_tools {
        hasher.write_str_framed(name);
        hasher.update(tool.package_step.variant_id.recipe_slice());
        hasher.write_str_framed(&tool.path);
        hasher.write_u32(tool.libs.len() as u32);
        for lib in &tool.libs {
            hasher.write_str_framed(lib);
        }
        let mut sorted_tool_env: Vec<(&String, &String)> = tool.environment.iter().collect();
        sorted_tool_env.sort_by(|a, b| a.0.cmp(b.0));
        hasher.write_u32(sorted_tool_env.len() as u32);
        for (k, v) in sorted_tool_env {
            hasher.write_str_framed(k);
            hasher.write_str_framed(v);
        }
        hasher.write_str_framed(tool.fingerprint_script.as_deref().unwrap_or(""));
    }

    hasher.write_u32(provided_deps.len() as u32);
    for dep in provided_deps {
        hasher.update(dep.variant_id.recipe_slice());
        if let Some(host) = dep.variant_id.host_slice() {
            hasher.fingerprint(&host);
        }
    }

    match provided_sandbox {
        Some(sandbox) => {
            hasher.write_bool(true);
            hasher.write_u32(sandbox.paths.len() as u32);
            for path in &sandbox.paths {
                hasher.write_str_framed(path);
            }
            hasher.write_u32(sandbox.mounts.len() as u32);
            for mount in &sandbox.mounts {
                hasher.write_str_framed(&mount.source);
                hasher.write_str_framed(&mount.target);
                hasher.write_bool(mount.read_only);
            }
            let mut sorted_sandbox_env: Vec<(&String, &String)> = sandbox.environment.iter().collect();
            sorted_sandbox_env.sort_by(|a, b| a.0.cmp(b.0));
            hasher.write_u32(sorted_sandbox_env.len() as u32);
            for (k, v) in sorted_sandbox_env {
                hasher.write_str_framed(k);
                hasher.write_str_framed(v);
            }
        }
        None => hasher.write_bool(false),
    }

    hasher.finish()
}

/// User-facing view of a [`CoreStep`], produced by [`crate::deref::deref_package`].
#[derive(Debug, Clone)]
pub struct Step {
    pub kind: StepKind,
    pub env: IndexMap<String, String>,
    pub script: Option<String>,
    pub variant_id: Digest,
    pub is_valid: bool,
    pub deterministic: bool,
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.variant_id == other.variant_id
    }
}

impl Eq for Step {}

impl PartialOrd for Step {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Step {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.variant_id.as_bytes().cmp(other.variant_id.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn empty_tools() -> IndexMap<String, CoreTool> {
        IndexMap::new()
    }

    #[test]
    fn no_script_and_empty_script_hash_identically() {
        let env = IndexMap::new();
        let tools = empty_tools();
        let a = compute_variant_id(&VariantIdInputs {
            fingerprinted: false,
            sandbox: None,
            digest_script: None,
            tools: &tools,
            digest_env: &env,
            args: &[],
        });
        let b = compute_variant_id(&VariantIdInputs {
            fingerprinted: false,
            sandbox: None,
            digest_script: Some(""),
            tools: &tools,
            digest_env: &env,
            args: &[],
        });
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn digest_env_order_does_not_affect_variant_id() {
        let tools = empty_tools();
        let mut env_a = IndexMap::new();
        env_a.insert("A".to_string(), "1".to_string());
        env_a.insert("B".to_string(), "2".to_string());
        let mut env_b = IndexMap::new();
        env_b.insert("B".to_string(), "2".to_string());
        env_b.insert("A".to_string(), "1".to_string());

        let a = compute_variant_id(&VariantIdInputs {
            fingerprinted: false,
            sandbox: None,
            digest_script: Some("true"),
            tools: &tools,
            digest_env: &env_a,
            args: &[],
        });
        let b = compute_variant_id(&VariantIdInputs {
            fingerprinted: false,
            sandbox: None,
            digest_script: Some("true"),
            tools: &tools,
            digest_env: &env_b,
            args: &[],
        });
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_script_changes_variant_id() {
        let tools = empty_tools();
        let env = IndexMap::new();
        let a = compute_variant_id(&VariantIdInputs {
            fingerprinted: false,
            sandbox: None,
            digest_script: Some("one"),
            tools: &tools,
            digest_env: &env,
            args: &[],
        });
        let b = compute_variant_id(&VariantIdInputs {
            fingerprinted: false,
            sandbox: None,
            digest_script: Some("two"),
            tools: &tools,
            digest_env: &env,
            args: &[],
        });
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
