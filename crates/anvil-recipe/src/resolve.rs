// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Class-inheritance resolution: turns a recipe's own [`ClassFragment`] plus the class map it
//! `inherit`s from into one fully-populated [`Recipe`].

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

use crate::{
    policy::Policies,
    recipe::Recipe,
    schema::{ClassFragment, StepKind, STEP_KINDS},
};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("recipe '{recipe}' inherits unknown class '{class}'")]
    UnknownClass { recipe: String, class: String },
    #[error("recipe '{recipe}' has a class-inheritance cycle through '{class}'")]
    ClassCycle { recipe: String, class: String },
    #[error("recipe '{recipe}': provides.deps pattern '{pattern}' matches no dependency")]
    UnmatchedProvideDepsPattern { recipe: String, pattern: String },
}

/// Compute the depth-first, post-order, visit-once-skip-self traversal of `fragment`'s
/// transitive `inherit` list against `classes`, then fold the resulting chain (parents before
/// the recipe's own fragment, which is always last) into a [`Recipe`].
pub fn resolve_classes(
    name: &str,
    base_name: &str,
    fragment: &ClassFragment,
    classes: &IndexMap<String, ClassFragment>,
    policies: &Policies,
) -> Result<Recipe, ResolveError> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for class_name in &fragment.inherit {
        visit_class(name, class_name, classes, &mut visited, &mut order, &mut HashSet::new())?;
    }

    let mut chain: Vec<&ClassFragment> = order.iter().map(|n| &classes[n]).collect();
    chain.push(fragment);

    let mut recipe = Recipe {
        name: name.to_string(),
        base_name: base_name.to_string(),
        classes_applied: order,
        depends: Vec::new(),
        env_filter: Default::default(),
        tools_filter: Default::default(),
        sandbox_filter: Default::default(),
        private_environment: Vec::new(),
        self_environment: Vec::new(),
        meta_environment: IndexMap::new(),
        vars: Default::default(),
        vars_weak: Default::default(),
        tools: Default::default(),
        provided_env: IndexMap::new(),
        provided_tools: IndexMap::new(),
        provide_deps: Vec::new(),
        provided_sandbox: None,
        scripts: Default::default(),
        digest_scripts: Default::default(),
        checkout_scm: Vec::new(),
        checkout_asserts: Vec::new(),
        checkout_deterministic: false,
        root: None.unwrap_or(false),
        shared: false,
        relocatable: false,
        build_net_access: false,
        package_net_access: false,
        fingerprint_scripts: Vec::new(),
        plugin_properties: IndexMap::new(),
    };

    let mut root_opt = None;
    let mut shared_opt = None;
    let mut relocatable_opt = None;
    let mut build_net_opt = None;
    let mut package_net_opt = None;

    for f in &chain {
        // Lists: deps and fingerprint scripts prepend (the most-derived fragment's additions run
        // first); checkout sources and asserts append (parent's run first).
        recipe.depends = f.depends.iter().cloned().chain(recipe.depends).collect();
        recipe.fingerprint_scripts = f.fingerprint.iter().cloned().chain(recipe.fingerprint_scripts).collect();
        recipe.checkout_scm.extend(f.checkout_scm.iter().cloned());
        recipe.checkout_asserts.extend(f.checkout_asserts.iter().cloned());

        recipe.env_filter.extend(&f.env_filter);
        recipe.tools_filter.extend(&f.tools_filter);
        recipe.sandbox_filter.extend(&f.sandbox_filter);

        if policies.merge_environment {
            if !f.private_environment.is_empty() {
                recipe.private_environment.push(f.private_environment.clone());
            }
            if !f.self_environment.is_empty() {
                recipe.self_environment.push(f.self_environment.clone());
            }
        } else {
            merge_single_layer(&mut recipe.private_environment, &f.private_environment);
            merge_single_layer(&mut recipe.self_environment, &f.self_environment);
        }
        for (k, v) in &f.meta_environment {
            recipe.meta_environment.insert(k.clone(), v.clone());
        }

        for kind in STEP_KINDS {
            recipe.vars.get_mut(kind).extend(f.vars(kind).iter().cloned());
            recipe.vars_weak.get_mut(kind).extend(f.weak_vars(kind).iter().cloned());
            recipe.tools.get_mut(kind).extend(f.tools(kind).iter().cloned());

            if let Some(script) = f.script(kind) {
                concat_script(recipe.scripts.get_mut(kind), script);
                concat_script(recipe.digest_scripts.get_mut(kind), script);
            }
        }

        for (k, v) in &f.provides.environment {
            recipe.provided_env.insert(k.clone(), v.clone());
        }
        for (k, v) in &f.provides.tools {
            recipe.provided_tools.insert(k.clone(), v.clone());
        }
        for pattern in &f.provides.deps {
            if !recipe.provide_deps.contains(pattern) {
                recipe.provide_deps.push(pattern.clone());
            }
        }
        if let Some(sandbox) = &f.provides.sandbox {
            recipe.provided_sandbox = Some(sandbox.clone());
        }

        if let Some(v) = f.root {
            root_opt = Some(v);
        }
        if let Some(v) = f.shared {
            shared_opt = Some(v);
        }
        if let Some(v) = f.relocatable {
            relocatable_opt = Some(v);
        }
        if let Some(v) = f.build_net_access {
            build_net_opt = Some(v);
        }
        if let Some(v) = f.package_net_access {
            package_net_opt = Some(v);
        }
        if let Some(v) = f.checkout_deterministic {
            recipe.checkout_deterministic = v;
        }
    }

    // weak-for-step inherits weak-for-earlier-step
    let checkout_weak = recipe.vars_weak.checkout.clone();
    recipe.vars_weak.build.extend(checkout_weak);
    let build_weak = recipe.vars_weak.build.clone();
    recipe.vars_weak.package.extend(build_weak);

    recipe.root = root_opt.unwrap_or(false);
    recipe.shared = shared_opt.unwrap_or(false);
    recipe.build_net_access = build_net_opt.unwrap_or(false);
    recipe.package_net_access = package_net_opt.unwrap_or(false);

    let legacy_relocatable_default = recipe.provided_tools.is_empty();
    recipe.relocatable = if policies.all_relocatable {
        true
    } else {
        relocatable_opt.unwrap_or(legacy_relocatable_default)
    };

    // package step is always valid: default to the empty script (and thus the SHA1-of-empty
    // digest, since digest_scripts defaults identically).
    if recipe.scripts.package.is_none() {
        recipe.scripts.package = Some(String::new());
        recipe.digest_scripts.package = Some(String::new());
    }

    let depends_names: HashSet<&str> = recipe.depends.iter().map(|d| d.recipe.as_str()).collect();
    let mut resolved_deps = Vec::new();
    for pattern in &recipe.provide_deps {
        let matcher = globset::Glob::new(pattern)
            .ok()
            .map(|g| g.compile_matcher());
        let mut matched_any = false;
        if let Some(matcher) = matcher {
            for dep_name in &depends_names {
                if matcher.is_match(dep_name) {
                    matched_any = true;
                    resolved_deps.push((*dep_name).to_string());
                }
            }
        }
        if !matched_any {
            return Err(ResolveError::UnmatchedProvideDepsPattern {
                recipe: name.to_string(),
                pattern: pattern.clone(),
            });
        }
    }
    recipe.provide_deps = resolved_deps;

    Ok(recipe)
}

fn merge_single_layer(layers: &mut Vec<IndexMap<String, String>>, new: &IndexMap<String, String>) {
    if layers.is_empty() {
        layers.push(IndexMap::new());
    }
    let base = &mut layers[0];
    for (k, v) in new {
        base.insert(k.clone(), v.clone());
    }
}

fn concat_script(slot: &mut Option<String>, addition: &str) {
    *slot = Some(match slot.take() {
        Some(existing) if !existing.is_empty() => format!("{existing}\n{addition}"),
        _ => addition.to_string(),
    });
}

fn visit_class(
    recipe_name: &str,
    class_name: &str,
    classes: &IndexMap<String, ClassFragment>,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
    stack: &mut HashSet<String>,
) -> Result<(), ResolveError> {
    if class_name == recipe_name || visited.contains(class_name) {
        return Ok(());
    }
    if !stack.insert(class_name.to_string()) {
        return Err(ResolveError::ClassCycle {
            recipe: recipe_name.to_string(),
            class: class_name.to_string(),
        });
    }
    let class = classes.get(class_name).ok_or_else(|| ResolveError::UnknownClass {
        recipe: recipe_name.to_string(),
        class: class_name.to_string(),
    })?;
    for parent in &class.inherit {
        visit_class(recipe_name, parent, classes, visited, order, stack)?;
    }
    stack.remove(class_name);
    if visited.insert(class_name.to_string()) {
        order.push(class_name.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fragment(yaml: &str) -> ClassFragment {
        ClassFragment::from_yaml(yaml.as_bytes()).unwrap()
    }

    #[test]
    fn empty_recipe_gets_default_package_step() {
        let recipe = resolve_classes("demo", "demo", &fragment("{}"), &IndexMap::new(), &Policies::default()).unwrap();
        assert_eq!(recipe.script(StepKind::Package), Some(""));
        assert!(recipe.relocatable);
    }

    #[test]
    fn class_fields_merge_parent_first() {
        let mut classes = IndexMap::new();
        classes.insert(
            "base".to_string(),
            fragment("buildScript: |\n  echo base\n"),
        );
        let child = fragment("inherit: [base]\nbuildScript: |\n  echo child\n");
        let recipe = resolve_classes("demo", "demo", &child, &classes, &Policies::default()).unwrap();
        assert_eq!(recipe.script(StepKind::Build), Some("echo base\n\necho child\n"));
        assert_eq!(recipe.classes_applied, vec!["base".to_string()]);
    }

    #[test]
    fn unknown_class_is_an_error() {
        let child = fragment("inherit: [missing]\n");
        let err = resolve_classes("demo", "demo", &child, &IndexMap::new(), &Policies::default()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownClass { .. }));
    }

    #[test]
    fn each_class_visited_once() {
        let mut classes = IndexMap::new();
        classes.insert("common".to_string(), fragment("buildScript: |\n  echo common\n"));
        classes.insert("a".to_string(), fragment("inherit: [common]\n"));
        classes.insert("b".to_string(), fragment("inherit: [common]\n"));
        let child = fragment("inherit: [a, b]\n");
        let recipe = resolve_classes("demo", "demo", &child, &classes, &Policies::default()).unwrap();
        assert_eq!(recipe.script(StepKind::Build), Some("echo common\n"));
        assert_eq!(recipe.classes_applied, vec!["common".to_string(), "a".to_string(), "b".to_string()]);
    }

    #[test]
    fn relocatable_defaults_false_when_recipe_provides_tools() {
        let child = fragment("provides:\n  tools:\n    cc:\n      path: /usr/bin/cc\n");
        let recipe = resolve_classes("demo", "demo", &child, &IndexMap::new(), &Policies::default()).unwrap();
        assert!(!recipe.relocatable);
    }

    #[test]
    fn all_relocatable_policy_forces_true() {
        let child = fragment("provides:\n  tools:\n    cc:\n      path: /usr/bin/cc\n");
        let policies = Policies {
            all_relocatable: true,
            ..Policies::default()
        };
        let recipe = resolve_classes("demo", "demo", &child, &IndexMap::new(), &policies).unwrap();
        assert!(recipe.relocatable);
    }

    #[test]
    fn provide_deps_resolves_glob_against_own_depends() {
        let child = fragment(
            "depends:\n  - name: libfoo\n  - name: libbar\nprovides:\n  deps: [\"lib*\"]\n",
        );
        let recipe = resolve_classes("demo", "demo", &child, &IndexMap::new(), &Policies::default()).unwrap();
        assert_eq!(recipe.provide_deps, vec!["libfoo".to_string(), "libbar".to_string()]);
    }

    #[test]
    fn provide_deps_unmatched_pattern_is_an_error() {
        let child = fragment("provides:\n  deps: [\"nothing*\"]\n");
        let err = resolve_classes("demo", "demo", &child, &IndexMap::new(), &Policies::default()).unwrap_err();
        assert!(matches!(err, ResolveError::UnmatchedProvideDepsPattern { .. }));
    }
}
