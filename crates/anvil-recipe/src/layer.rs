// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Layered `config.yaml` loading (§4.4/§6): `bobMinimumVersion`, the plugin name list, policy
//! overrides, and recursive `layers: [...]` sub-projects. Walked depth-first from the project
//! root; a sub-layer may only set a policy already settled by an ancestor to the *same* value,
//! never override it, per the distilled spec's "layer policy conflict" error kind.

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use crate::{policy::Policies, recipe_set::SourceTree};

/// The raw shape of one `config.yaml` (root or `layers/<name>/config.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigYaml {
    pub bob_minimum_version: Option<String>,
    pub plugins: Vec<String>,
    pub policies: IndexMap<String, bool>,
    pub layers: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("parsing '{path}'")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("reading '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{path}' sets unknown policy '{name}'")]
    UnknownPolicy { path: String, name: String },
    #[error("layer '{layer}' sets policy '{name}' to {value}, conflicting with the value {existing} already settled by an ancestor layer")]
    LayerPolicyConflict { layer: String, name: String, value: bool, existing: bool },
}

/// The effective policy set and deduplicated plugin name list after walking every layer reachable
/// from the project root, root-first.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub policies: Policies,
    pub plugins: Vec<String>,
}

/// Read `config.yaml` at the project root (if present — a project with none gets all-default
/// [`Policies`]) and recursively every `layers/<name>/config.yaml` it names.
pub fn load_layered_config(tree: &dyn SourceTree) -> Result<LoadedConfig, LayerError> {
    let mut policies = Policies::default();
    let mut locked: IndexMap<String, bool> = IndexMap::new();
    let mut plugins = Vec::new();
    load_layer(tree, "config.yaml", "<root>", &mut policies, &mut locked, &mut plugins)?;
    Ok(LoadedConfig { policies, plugins })
}

fn load_layer(
    tree: &dyn SourceTree,
    path: &str,
    layer_label: &str,
    policies: &mut Policies,
    locked: &mut IndexMap<String, bool>,
    plugins: &mut Vec<String>,
) -> Result<(), LayerError> {
    let bytes = match tree.read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(LayerError::Io {
                path: path.to_string(),
                source,
            })
        }
    };
    let config: ConfigYaml = serde_yaml::from_slice(&bytes).map_err(|source| LayerError::Yaml {
        path: path.to_string(),
        source,
    })?;
    log::debug!("loaded layer config '{path}' ({} sub-layer(s))", config.layers.len());

    for (name, value) in &config.policies {
        apply_policy(policies, path, name, *value)?;
        match locked.get(name) {
            Some(existing) if existing != value => {
                return Err(LayerError::LayerPolicyConflict {
                    layer: layer_label.to_string(),
                    name: name.clone(),
                    value: *value,
                    existing: *existing,
                })
            }
            Some(_) => {}
            None => {
                locked.insert(name.clone(), *value);
            }
        }
    }
    for plugin in &config.plugins {
        if !plugins.contains(plugin) {
            plugins.push(plugin.clone());
        }
    }

    for layer in &config.layers {
        let sub_path = format!("layers/{layer}/config.yaml");
        load_layer(tree, &sub_path, layer, policies, locked, plugins)?;
    }
    Ok(())
}

fn apply_policy(policies: &mut Policies, path: &str, name: &str, value: bool) -> Result<(), LayerError> {
    match name {
        "mergeEnvironment" => policies.merge_environment = value,
        "allRelocatable" => policies.all_relocatable = value,
        "uniqueDependency" => policies.unique_dependency = value,
        "sandboxInvariant" => policies.sandbox_invariant = value,
        "offlineBuild" => policies.offline_build = value,
        "relativeIncludes" => policies.relative_includes = value,
        other => {
            return Err(LayerError::UnknownPolicy {
                path: path.to_string(),
                name: other.to_string(),
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    struct MemTree {
        files: HashMap<String, Vec<u8>>,
    }

    impl MemTree {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                files: entries.iter().map(|(p, c)| (p.to_string(), c.as_bytes().to_vec())).collect(),
            }
        }
    }

    impl SourceTree for MemTree {
        fn list_yaml(&self, _dir: &str) -> std::io::Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn list_all(&self, _dir: &str) -> std::io::Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        }
    }

    #[test]
    fn missing_config_yields_defaults() {
        let tree = MemTree::new(&[]);
        let loaded = load_layered_config(&tree).unwrap();
        assert!(!loaded.policies.all_relocatable);
        assert!(loaded.plugins.is_empty());
    }

    #[test]
    fn root_policy_applies() {
        let tree = MemTree::new(&[("config.yaml", "policies:\n  allRelocatable: true\n")]);
        let loaded = load_layered_config(&tree).unwrap();
        assert!(loaded.policies.all_relocatable);
    }

    #[test]
    fn sub_layer_may_repeat_same_policy_value() {
        let tree = MemTree::new(&[
            ("config.yaml", "policies:\n  allRelocatable: true\nlayers: [vendor]\n"),
            ("layers/vendor/config.yaml", "policies:\n  allRelocatable: true\n"),
        ]);
        let loaded = load_layered_config(&tree).unwrap();
        assert!(loaded.policies.all_relocatable);
    }

    #[test]
    fn sub_layer_conflicting_policy_value_rejected() {
        let tree = MemTree::new(&[
            ("config.yaml", "policies:\n  allRelocatable: true\nlayers: [vendor]\n"),
            ("layers/vendor/config.yaml", "policies:\n  allRelocatable: false\n"),
        ]);
        let err = load_layered_config(&tree).unwrap_err();
        assert!(matches!(err, LayerError::LayerPolicyConflict { .. }));
    }

    #[test]
    fn unknown_policy_name_rejected() {
        let tree = MemTree::new(&[("config.yaml", "policies:\n  madeUpPolicy: true\n")]);
        let err = load_layered_config(&tree).unwrap_err();
        assert!(matches!(err, LayerError::UnknownPolicy { .. }));
    }

    #[test]
    fn plugins_are_deduplicated_across_layers() {
        let tree = MemTree::new(&[
            ("config.yaml", "plugins: [rust]\nlayers: [extra]\n"),
            ("layers/extra/config.yaml", "plugins: [rust, golang]\n"),
        ]);
        let loaded = load_layered_config(&tree).unwrap();
        assert_eq!(loaded.plugins, vec!["rust".to_string(), "golang".to_string()]);
    }
}
