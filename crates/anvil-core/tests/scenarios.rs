// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end elaboration scenarios, each driving a `RecipeSet` built from in-memory fixtures
//! through to an [`anvil_core::elaborate::Elaborator`], exactly as a loader backed by a real
//! filesystem would.

use std::collections::HashMap;

use anvil_core::arena::PackageId;
use anvil_core::core_ref::CoreRef;
use anvil_core::elaborate::{Elaborator, RecipeSetContext};
use anvil_digest::Digest;
use anvil_recipe::{Policies, RecipeSet, SourceTree};

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
    fn list_yaml(&self, dir: &str) -> std::io::Result<Vec<String>> {
        let prefix = format!("{dir}/");
        let mut out: Vec<String> = self
            .files
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix).map(str::to_string))
            .filter(|p| p.ends_with(".yaml"))
            .collect();
        out.sort();
        Ok(out)
    }

    fn list_all(&self, dir: &str) -> std::io::Result<Vec<String>> {
        let prefix = format!("{dir}/");
        let mut out: Vec<String> =
            self.files.keys().filter_map(|p| p.strip_prefix(&prefix).map(str::to_string)).collect();
        out.sort();
        Ok(out)
    }

    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
    }
}

fn direct_dep(elaborator: &Elaborator, pkg_id: PackageId, recipe_name: &str) -> CoreRef {
    elaborator
        .packages()
        .get(pkg_id.0)
        .direct_dep_steps
        .iter()
        .find(|r| r.source_recipe == recipe_name)
        .cloned()
        .unwrap_or_else(|| panic!("no direct dep named '{recipe_name}'"))
}

#[test]
fn minimal_single_recipe_has_stable_package_step() {
    let tree = MemTree::new(&[("recipes/hello.yaml", "root: true\npackageScript: echo hi\n")]);

    let set = RecipeSet::populate(&tree, Policies::default(), &Default::default()).unwrap();
    let mut elaborator = Elaborator::new(RecipeSetContext::new(&set));
    let root_id = elaborator.elaborate_root().unwrap();

    let hello_ref = direct_dep(&elaborator, root_id, "hello");
    let hello_step_id = hello_ref.step_id().unwrap();
    let hello_step = elaborator.steps().get(hello_step_id.0);
    assert!(hello_step.is_valid);
    assert!(matches!(hello_step.variant_id, Digest::Short(_)));

    let hello_pkg = elaborator.packages().get(hello_step.package.0);
    assert!(hello_pkg.build_step.is_none());
    let checkout_step = elaborator.steps().get(hello_pkg.checkout_step.0);
    assert!(!checkout_step.is_valid);

    // Re-elaborating an identical tree from scratch yields a byte-identical Variant-Id.
    let set2 = RecipeSet::populate(&tree, Policies::default(), &Default::default()).unwrap();
    let mut elaborator2 = Elaborator::new(RecipeSetContext::new(&set2));
    let root_id2 = elaborator2.elaborate_root().unwrap();
    let hello_ref2 = direct_dep(&elaborator2, root_id2, "hello");
    let hello_step2 = elaborator2.steps().get(hello_ref2.step_id().unwrap().0);
    assert_eq!(hello_step.variant_id, hello_step2.variant_id);
}

#[test]
fn inheritance_without_merge_environment_flattens_to_child_override() {
    let tree = MemTree::new(&[
        ("classes/c.yaml", "environment:\n  A: \"1\"\n  B: \"2\"\n"),
        (
            "recipes/r.yaml",
            "root: true\ninherit: [c]\nenvironment:\n  B: \"3\"\n  C: \"4\"\npackageVars: [A, B, C]\npackageScript: \"true\"\n",
        ),
    ]);

    let set = RecipeSet::populate(&tree, Policies::default(), &Default::default()).unwrap();
    let mut elaborator = Elaborator::new(RecipeSetContext::new(&set));
    let root_id = elaborator.elaborate_root().unwrap();

    let r_ref = direct_dep(&elaborator, root_id, "r");
    let r_step = elaborator.steps().get(r_ref.step_id().unwrap().0);
    assert_eq!(r_step.digest_env.get("A").map(String::as_str), Some("1"));
    assert_eq!(r_step.digest_env.get("B").map(String::as_str), Some("3"));
    assert_eq!(r_step.digest_env.get("C").map(String::as_str), Some("4"));
}

#[test]
fn inheritance_with_merge_environment_applies_layers_parent_then_child() {
    let tree = MemTree::new(&[
        ("classes/c.yaml", "environment:\n  A: \"1\"\n  B: \"2\"\n"),
        (
            "recipes/r.yaml",
            "root: true\ninherit: [c]\nenvironment:\n  D: \"$B\"\n  B: \"3\"\n  C: \"4\"\npackageVars: [A, B, C, D]\npackageScript: \"true\"\n",
        ),
    ]);

    let mut policies = Policies::default();
    policies.merge_environment = true;
    let set = RecipeSet::populate(&tree, policies, &Default::default()).unwrap();
    let mut elaborator = Elaborator::new(RecipeSetContext::new(&set));
    let root_id = elaborator.elaborate_root().unwrap();

    let r_ref = direct_dep(&elaborator, root_id, "r");
    let r_step = elaborator.steps().get(r_ref.step_id().unwrap().0);
    // D's "$B" is substituted against the parent class's layer, applied before the child's own
    // B override lands.
    assert_eq!(r_step.digest_env.get("D").map(String::as_str), Some("2"));
    assert_eq!(r_step.digest_env.get("B").map(String::as_str), Some("3"));
}

#[test]
fn provide_and_use_environment_exposes_provided_vars_to_caller() {
    let tree = MemTree::new(&[
        ("recipes/lib.yaml", "packageScript: \"true\"\nprovides:\n  environment:\n    LIB_PATH: /opt/lib\n"),
        (
            "recipes/app.yaml",
            "root: true\ndepends:\n  - name: lib\n    use: [result, environment]\nbuildScript: \"true\"\npackageVars: [LIB_PATH]\npackageScript: echo $LIB_PATH\n",
        ),
    ]);

    let set = RecipeSet::populate(&tree, Policies::default(), &Default::default()).unwrap();
    let mut elaborator = Elaborator::new(RecipeSetContext::new(&set));
    let root_id = elaborator.elaborate_root().unwrap();

    let app_ref = direct_dep(&elaborator, root_id, "app");
    let app_step = elaborator.steps().get(app_ref.step_id().unwrap().0);
    assert_eq!(app_step.digest_env.get("LIB_PATH").map(String::as_str), Some("/opt/lib"));

    let app_pkg = elaborator.packages().get(app_step.package.0);
    let lib_ref = direct_dep(&elaborator, app_step.package, "lib");
    let build_step = elaborator.steps().get(app_pkg.build_step.expect("app has a build script").0);
    assert!(build_step.args.iter().any(|a| a.step_id() == lib_ref.step_id()));
}

#[test]
fn tool_forwarding_threads_through_sibling_dependency() {
    let tree = MemTree::new(&[
        (
            "recipes/compiler.yaml",
            "packageScript: \"true\"\nprovides:\n  tools:\n    cc:\n      path: /usr/bin/cc\n      environment:\n        CC: /usr/bin/cc\n",
        ),
        (
            "recipes/leaf.yaml",
            "packageTools: [cc]\npackageScript: \"true\"\n",
        ),
        (
            "recipes/app.yaml",
            "root: true\ndepends:\n  - name: compiler\n    use: [tools]\n    forward: true\n  - name: leaf\n    use: [result]\npackageScript: \"true\"\n",
        ),
    ]);

    let set = RecipeSet::populate(&tree, Policies::default(), &Default::default()).unwrap();
    let mut elaborator = Elaborator::new(RecipeSetContext::new(&set));
    let root_id = elaborator.elaborate_root().unwrap();

    let app_ref = direct_dep(&elaborator, root_id, "app");
    let app_step = elaborator.steps().get(app_ref.step_id().unwrap().0);
    let app_pkg = elaborator.packages().get(app_step.package.0);

    let leaf_ref = app_pkg
        .direct_dep_steps
        .iter()
        .find(|r| r.source_recipe == "leaf")
        .expect("leaf is a direct dependency of app");
    assert!(leaf_ref.diff_tools.contains_key("cc"));

    let leaf_step = elaborator.steps().get(leaf_ref.step_id().unwrap().0);
    assert!(leaf_step.tools.contains_key("cc"));
    assert_eq!(leaf_step.tools["cc"].path, "/usr/bin/cc");
}

#[test]
fn dependency_cycle_is_rejected() {
    let tree = MemTree::new(&[
        ("recipes/a.yaml", "root: true\ndepends:\n  - name: b\npackageScript: \"true\"\n"),
        ("recipes/b.yaml", "depends:\n  - name: a\npackageScript: \"true\"\n"),
    ]);

    let set = RecipeSet::populate(&tree, Policies::default(), &Default::default()).unwrap();
    let mut elaborator = Elaborator::new(RecipeSetContext::new(&set));
    let err = elaborator.elaborate_root().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cyclic dependency"), "unexpected error: {message}");
}

#[test]
fn memoization_reuses_package_for_equal_touched_inputs() {
    let tree = MemTree::new(&[
        ("recipes/shared.yaml", "packageScript: \"true\"\n"),
        (
            "recipes/one.yaml",
            "root: true\ndepends:\n  - name: shared\npackageScript: \"true\"\n",
        ),
        (
            "recipes/two.yaml",
            "root: true\ndepends:\n  - name: shared\npackageScript: \"true\"\n",
        ),
    ]);

    let set = RecipeSet::populate(&tree, Policies::default(), &Default::default()).unwrap();
    let mut elaborator = Elaborator::new(RecipeSetContext::new(&set));
    let root_id = elaborator.elaborate_root().unwrap();

    let one_ref = direct_dep(&elaborator, root_id, "one");
    let one_step = elaborator.steps().get(one_ref.step_id().unwrap().0);
    let one_pkg = elaborator.packages().get(one_step.package.0);
    let shared_via_one = one_pkg.direct_dep_steps.iter().find(|r| r.source_recipe == "shared").unwrap();

    let two_ref = direct_dep(&elaborator, root_id, "two");
    let two_step = elaborator.steps().get(two_ref.step_id().unwrap().0);
    let two_pkg = elaborator.packages().get(two_step.package.0);
    let shared_via_two = two_pkg.direct_dep_steps.iter().find(|r| r.source_recipe == "shared").unwrap();

    let shared_pkg_via_one = elaborator.steps().get(shared_via_one.step_id().unwrap().0).package;
    let shared_pkg_via_two = elaborator.steps().get(shared_via_two.step_id().unwrap().0).package;
    assert_eq!(shared_pkg_via_one, shared_pkg_via_two);
}
