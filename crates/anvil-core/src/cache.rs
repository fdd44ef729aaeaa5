// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! The persistence design from §6/§9: a SHA1 cache key that gates whether a previous elaboration
//! can be trusted without re-running `prepare`, plus the versioned on-disk snapshot format that
//! stands in for the Python original's pickle cache.
//!
//! A snapshot never carries a live [`crate::package::CorePackage`]/[`crate::step::CoreStep`] graph
//! across the wire — only the digest identities and recipe-name back-references needed to decide
//! "is this still valid" and to re-anchor against a freshly loaded [`anvil_recipe::RecipeSet`].
//! Plugin state and the full tool/sandbox overlay graph are rebuilt by re-elaborating; they are not
//! part of what gets persisted, since a stale snapshot is simply discarded in favour of a fresh
//! `prepare` run rather than partially reused.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use anvil_digest::{Digest, DigestHasher, HASH_LEN};

use crate::elaborate::Elaborator;

/// Bumped whenever [`PersistedGraph`]'s shape changes; a snapshot written by an older/newer format
/// version is treated as absent rather than partially decoded.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// SHA1 over the tool's own version tag, the sorted table of consumed recipe/class file digests
/// (the "YAML-cache digest"), the sorted effective environment, and a single sandbox-enabled byte.
/// Two elaborations that would produce byte-identical output always agree on this key; any change
/// to a consumed file, the tool version, or the environment changes it.
pub fn compute_cache_key(
    tool_version: &str,
    file_digests: &IndexMap<String, [u8; HASH_LEN]>,
    effective_env: &IndexMap<String, String>,
    sandbox_enabled: bool,
) -> Digest {
    let mut hasher = DigestHasher::new();
    hasher.write_str_framed(tool_version);

    let mut sorted_files: Vec<(&String, &[u8; HASH_LEN])> = file_digests.iter().collect();
    sorted_files.sort_by(|a, b| a.0.cmp(b.0));
    hasher.write_u32(sorted_files.len() as u32);
    for (path, digest) in sorted_files {
        hasher.write_str_framed(path);
        hasher.update(digest);
    }

    let mut sorted_env: Vec<(&String, &String)> = effective_env.iter().collect();
    sorted_env.sort_by(|a, b| a.0.cmp(b.0));
    hasher.write_u32(sorted_env.len() as u32);
    for (k, v) in sorted_env {
        hasher.write_str_framed(k);
        hasher.write_str_framed(v);
    }

    hasher.write_bool(sandbox_enabled);
    hasher.finish()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHeader {
    pub format_version: u32,
    pub cache_key: Vec<u8>,
}

/// A package's durable identity: its recipe name plus the arena indices of its own steps, so a
/// snapshot can be walked without holding onto the `Elaborator` that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPackage {
    pub recipe_name: String,
    pub checkout_step: u32,
    pub build_step: Option<u32>,
    pub package_step: u32,
}

/// A step's durable identity. `package` is the owning [`PersistedPackage`]'s index into
/// [`PersistedGraph::packages`], never a raw pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStep {
    pub package: u32,
    pub variant_id: Vec<u8>,
    pub result_id: Vec<u8>,
    pub is_valid: bool,
    pub deterministic: bool,
}

/// The full on-disk snapshot: a header naming the format version and cache key this snapshot was
/// produced under, followed by a flat array of nodes addressed by `pkg_id`/`step_id` — never a
/// serialised pointer, and never the `Recipe` itself (a loader re-resolves `recipe_name` against
/// the live `RecipeSet` it already has in hand).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedGraph {
    pub header: CacheHeader,
    pub packages: Vec<PersistedPackage>,
    pub steps: Vec<PersistedStep>,
}

impl PersistedGraph {
    /// Snapshot every package/step `elaborator` has produced so far, stamped with `cache_key`.
    pub fn snapshot(elaborator: &Elaborator<'_>, cache_key: Digest) -> Self {
        let packages = elaborator
            .packages()
            .iter()
            .map(|pkg| PersistedPackage {
                recipe_name: pkg.recipe_name.clone(),
                checkout_step: pkg.checkout_step.0,
                build_step: pkg.build_step.map(|s| s.0),
                package_step: pkg.package_step.0,
            })
            .collect();
        let steps = elaborator
            .steps()
            .iter()
            .map(|step| PersistedStep {
                package: step.package.0,
                variant_id: step.variant_id.as_bytes().to_vec(),
                result_id: step.result_id.as_bytes().to_vec(),
                is_valid: step.is_valid,
                deterministic: step.deterministic,
            })
            .collect();
        Self {
            header: CacheHeader {
                format_version: CACHE_FORMAT_VERSION,
                cache_key: cache_key.as_bytes().to_vec(),
            },
            packages,
            steps,
        }
    }

    /// `true` when this snapshot was produced under exactly `expected_key` by a build that shares
    /// this one's format version — the only condition under which reusing it (instead of
    /// re-running `prepare`) is safe.
    pub fn is_fresh(&self, expected_key: Digest) -> bool {
        self.header.format_version == CACHE_FORMAT_VERSION && self.header.cache_key == expected_key.as_bytes()
    }

    /// Encode as CBOR (the binary encoding `ConaryLabs-Conary` reaches for the same "compact,
    /// versioned, not a pickle" niche `serde_yaml` would be the wrong tool for here).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_key_changes_with_any_input() {
        let mut files = IndexMap::new();
        files.insert("recipes/a.yaml".to_string(), [1u8; HASH_LEN]);
        let mut env = IndexMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());

        let base = compute_cache_key("1.0.0", &files, &env, false);

        let mut files2 = files.clone();
        files2.insert("recipes/a.yaml".to_string(), [2u8; HASH_LEN]);
        assert_ne!(base.as_bytes(), compute_cache_key("1.0.0", &files2, &env, false).as_bytes());

        assert_ne!(base.as_bytes(), compute_cache_key("1.0.1", &files, &env, false).as_bytes());
        assert_ne!(base.as_bytes(), compute_cache_key("1.0.0", &files, &env, true).as_bytes());
    }

    #[test]
    fn cache_key_is_order_independent() {
        let mut files_a = IndexMap::new();
        files_a.insert("classes/c.yaml".to_string(), [1u8; HASH_LEN]);
        files_a.insert("recipes/a.yaml".to_string(), [2u8; HASH_LEN]);
        let mut files_b = IndexMap::new();
        files_b.insert("recipes/a.yaml".to_string(), [2u8; HASH_LEN]);
        files_b.insert("classes/c.yaml".to_string(), [1u8; HASH_LEN]);

        let env = IndexMap::new();
        let a = compute_cache_key("1.0.0", &files_a, &env, false);
        let b = compute_cache_key("1.0.0", &files_b, &env, false);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn round_trips_through_cbor() {
        let header = CacheHeader {
            format_version: CACHE_FORMAT_VERSION,
            cache_key: vec![1, 2, 3],
        };
        let graph = PersistedGraph {
            header,
            packages: vec![PersistedPackage {
                recipe_name: "hello".to_string(),
                checkout_step: 0,
                build_step: None,
                package_step: 1,
            }],
            steps: vec![PersistedStep {
                package: 0,
                variant_id: vec![9; HASH_LEN],
                result_id: vec![9; HASH_LEN],
                is_valid: true,
                deterministic: false,
            }],
        };

        let bytes = graph.to_bytes().unwrap();
        let decoded = PersistedGraph::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.packages[0].recipe_name, "hello");
        assert_eq!(decoded.steps[0].variant_id, vec![9; HASH_LEN]);
    }

    #[test]
    fn is_fresh_rejects_mismatched_key() {
        let mut files = IndexMap::new();
        files.insert("recipes/a.yaml".to_string(), [1u8; HASH_LEN]);
        let env = IndexMap::new();
        let key = compute_cache_key("1.0.0", &files, &env, false);

        let graph = PersistedGraph {
            header: CacheHeader {
                format_version: CACHE_FORMAT_VERSION,
                cache_key: key.as_bytes().to_vec(),
            },
            packages: Vec::new(),
            steps: Vec::new(),
        };
        assert!(graph.is_fresh(key));

        let mut other_files = files.clone();
        other_files.insert("recipes/b.yaml".to_string(), [2u8; HASH_LEN]);
        let other_key = compute_cache_key("1.0.0", &other_files, &env, false);
        assert!(!graph.is_fresh(other_key));
    }
}
