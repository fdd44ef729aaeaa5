// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! [`Elaborator`]: walks a [`RecipeSet`] from its virtual root, turning recipes into the
//! immutable package/step graph, per the `prepare` propagation algorithm.
//!
//! No process-wide mutable state: every recipe lookup goes through the borrowed
//! [`RecipeSetContext`] rather than a global registry, and the arenas/memoization tables live on
//! `Elaborator` itself, so two elaborations (e.g. of two different `RecipeSet`s in the same
//! process, as a test suite would do) never share state.

use indexmap::{IndexMap, IndexSet};

use anvil_dag::Dag;
use anvil_digest::Digest;
use anvil_env::{Env, EnvError, FunArgs};
use anvil_recipe::{AbstractTool, Dependency, GlobList, Recipe, RecipeSet, SandboxTemplate, StepKind, UseKind, VIRTUAL_ROOT_NAME};

use crate::{
    arena::{Arena, PackageId, StepId},
    core_ref::{CoreRef, CoreTarget, DiffSandbox},
    diagnostics::WarnOnce,
    error::{Error, ErrorKind, Result},
    matcher::PackageMatcher,
    package::{CorePackage, PluginState},
    sandbox::CoreSandbox,
    step::{compute_result_id, compute_variant_id, CoreStep, VariantIdInputs},
    tool::CoreTool,
    toolset::ToolSet,
};

/// Everything `prepare` needs besides the recipe it is currently elaborating: the loaded
/// recipe/class map and its policies. Threaded explicitly rather than reached for through a
/// singleton, so nothing about elaboration depends on process-wide state.
#[derive(Clone, Copy)]
pub struct RecipeSetContext<'r> {
    pub recipes: &'r RecipeSet,
}

impl<'r> RecipeSetContext<'r> {
    pub fn new(recipes: &'r RecipeSet) -> Self {
        Self { recipes }
    }

    fn lookup(&self, name: &str) -> Option<&'r Recipe> {
        self.recipes.get(name)
    }
}

/// Owns the package/step arenas and the memoization tables for one elaboration run.
pub struct Elaborator<'r> {
    ctx: RecipeSetContext<'r>,
    packages: Arena<CorePackage>,
    steps: Arena<CoreStep>,
    /// Per-recipe-name `PackageMatcher` list, checked in insertion order on every `prepare` call.
    matchers: IndexMap<String, Vec<PackageMatcher>>,
    /// Per-recipe-name Result-Id -> package, catching equivalent packages whose matchers
    /// happened to capture different touched subsets.
    result_index: IndexMap<String, IndexMap<Digest, PackageId>>,
    warn_once: WarnOnce,
}

/// Mutable state threaded through one `prepare` call's dependency loop (including nested
/// `depends` entries), kept in one struct so `process_dependency` doesn't need a dozen `&mut`
/// parameters.
struct Accum {
    /// The recipe's own accumulating view: every incoming provide lands here regardless of
    /// `forward`.
    env: Env,
    tools: ToolSet,
    sandbox: Option<CoreRef>,
    sandbox_enabled: bool,
    /// Passed down to the *next* dependency in this recipe; only forwarded provides land here.
    dep_env: Env,
    dep_tools: ToolSet,
    dep_sandbox: Option<CoreRef>,
    states: IndexMap<String, Box<dyn PluginState>>,
    dep_states: IndexMap<String, Box<dyn PluginState>>,
    /// The tool/sandbox delta accumulated so far in this call, stamped onto every `CoreRef` built
    /// for a dependency from this point on.
    diff_tools: IndexMap<String, Option<CoreRef>>,
    diff_sandbox: DiffSandbox,
    indirect: Vec<CoreRef>,
    /// `result`-use refs, in dependency order, becoming the build step's (or package step's, if
    /// no build script) extra args.
    args: Vec<CoreRef>,
    seen_result_names: IndexSet<String>,
    seen_dep_variants: IndexMap<String, Digest>,
    /// `provideDeps`-matched refs, keyed by source recipe name to dedupe across siblings.
    provided_deps: IndexMap<String, CoreRef>,
    /// Recipe names reachable from any dependency processed so far.
    subtree: IndexSet<String>,
}

impl<'r> Elaborator<'r> {
    pub fn new(ctx: RecipeSetContext<'r>) -> Self {
        Self {
            ctx,
            packages: Arena::new(),
            steps: Arena::new(),
            matchers: IndexMap::new(),
            result_index: IndexMap::new(),
            warn_once: WarnOnce::new(),
        }
    }

    pub fn steps(&self) -> &Arena<CoreStep> {
        &self.steps
    }

    pub fn packages(&self) -> &Arena<CorePackage> {
        &self.packages
    }

    /// Elaborate the virtual root with an empty starting environment, no tools, sandbox disabled.
    /// The convenience entry point a CLI/test harness would call.
    pub fn elaborate_root(&mut self) -> Result<PackageId> {
        let mut env = Env::new();
        env.touch_reset();
        let tools = ToolSet::new();
        let (pkg_id, _) = self.prepare(VIRTUAL_ROOT_NAME, env, false, IndexMap::new(), None, tools, &IndexSet::new())?;
        Ok(pkg_id)
    }

    /// Elaborate `recipe_name` given the inputs propagated down from its caller. Returns the
    /// resulting package plus the set of recipe names reachable from it (including itself), used
    /// by the caller for cycle re-checking on a future memoized hit.
    pub fn prepare(
        &mut self,
        recipe_name: &str,
        input_env: Env,
        sandbox_enabled: bool,
        input_states: IndexMap<String, Box<dyn PluginState>>,
        input_sandbox: Option<CoreRef>,
        input_tools: ToolSet,
        stack: &IndexSet<String>,
    ) -> Result<(PackageId, IndexSet<String>)> {
        if stack.contains(recipe_name) {
            return Err(ErrorKind::Cycle { recipe: recipe_name.to_string() }.into());
        }

        if let Some(matchers) = self.matchers.get(recipe_name) {
            for matcher in matchers {
                if matcher.matches(&input_env, &input_tools, &input_states, input_sandbox.as_ref()) {
                    for name in stack {
                        if matcher.subtree_packages.contains(name) {
                            return Err(ErrorKind::Cycle { recipe: recipe_name.to_string() }.into());
                        }
                    }
                    matcher.touch(&input_env, &input_tools);
                    return Ok((matcher.package, matcher.subtree_packages.clone()));
                }
            }
        }

        let recipe = self
            .ctx
            .lookup(recipe_name)
            .ok_or_else(|| Error::from(ErrorKind::UnknownRecipe { name: recipe_name.to_string() }))?;

        let own_env = filter_env(&input_env, &recipe.env_filter)?;
        let own_tools = filter_tools(&input_tools, &recipe.tools_filter)?;
        // `sandboxFilter` is not resolved to a concrete target set by this distillation; the
        // sandbox itself passes through unchanged and the filter only ever narrows env/tools.
        let own_sandbox = input_sandbox.clone();

        let mut acc = Accum {
            dep_env: own_env.derive(),
            dep_tools: own_tools.derive(),
            dep_sandbox: own_sandbox.clone(),
            env: own_env,
            tools: own_tools,
            sandbox: own_sandbox,
            sandbox_enabled,
            states: input_states.clone(),
            dep_states: input_states,
            diff_tools: IndexMap::new(),
            diff_sandbox: DiffSandbox::Inherit,
            indirect: Vec::new(),
            args: Vec::new(),
            seen_result_names: IndexSet::new(),
            seen_dep_variants: IndexMap::new(),
            provided_deps: IndexMap::new(),
            subtree: IndexSet::new(),
        };

        let mut child_stack = stack.clone();
        child_stack.insert(recipe_name.to_string());

        let depends = recipe.depends.clone();
        for dep in &depends {
            self.process_dependency(recipe_name, recipe, dep, &child_stack, &mut acc)?;
        }

        for pattern in &recipe.provide_deps {
            if !acc.provided_deps.contains_key(pattern) {
                self.warn_once.warn(
                    format!("provide-deps-miss:{recipe_name}:{pattern}"),
                    format!("recipe '{recipe_name}': provideDeps entry '{pattern}' matched no dependency"),
                );
            }
        }

        let indirect_dep_steps = dedup_by_source(&acc.indirect, recipe_name)?;

        apply_tool_environments(recipe_name, &acc.tools, &mut acc.env)?;
        apply_env_layers(&mut acc.env, &recipe.self_environment, &format!("{recipe_name}:environment"))?;
        apply_env_layers(&mut acc.env, &recipe.private_environment, &format!("{recipe_name}:privateEnvironment"))?;
        for (k, v) in &recipe.meta_environment {
            acc.env.set(k.clone(), v.clone());
        }
        acc.env.set("BOB_RECIPE_NAME", recipe.name.clone());
        acc.env.set("BOB_PACKAGE_NAME", recipe.base_name.clone());

        let fingerprint_mask = compute_fingerprint_mask(recipe_name, recipe, &acc.tools, &acc.env, acc.sandbox_enabled)?;
        let fingerprinted = fingerprint_mask != 0;

        let checkout_sandbox = extract_sandbox(&acc.sandbox);
        let checkout_strong: Vec<String> = recipe.vars.checkout.iter().cloned().collect();
        let mut checkout_names = checkout_strong.clone();
        checkout_names.extend(recipe.vars_weak.checkout.iter().cloned());
        let checkout_digest_env = acc.env.filter(&checkout_strong)?;
        let checkout_env_view = acc.env.filter(&checkout_names)?;
        let checkout_tools = toolset_to_map(&acc.tools.retain_named(&recipe.tools.checkout));
        let checkout_digest_script = recipe
            .digest_script(StepKind::Checkout)
            .map(|s| checkout_digest_env.substitute(s, &format!("{recipe_name}:checkoutScript#digest")))
            .transpose()?;
        let checkout_script = recipe
            .script(StepKind::Checkout)
            .map(|s| checkout_env_view.substitute(s, &format!("{recipe_name}:checkoutScript")))
            .transpose()?;
        let checkout_is_valid = recipe.step_is_valid(StepKind::Checkout);
        let checkout_variant = compute_variant_id(&VariantIdInputs {
            fingerprinted,
            sandbox: checkout_sandbox.as_ref(),
            digest_script: checkout_digest_script.as_deref(),
            tools: &checkout_tools,
            digest_env: &env_to_map(&checkout_digest_env),
            args: &[],
        });
        let checkout_deterministic = recipe.checkout_deterministic;
        let checkout_result_id = compute_result_id(checkout_variant, &IndexMap::new(), &IndexMap::new(), &[], None);
        let checkout_step_id = StepId(self.steps.push(CoreStep {
            kind: StepKind::Checkout,
            package: PackageId(0),
            digest_env: env_to_map(&checkout_digest_env),
            env: env_to_map(&checkout_env_view),
            script: checkout_script,
            digest_script: checkout_digest_script,
            args: Vec::new(),
            tools: checkout_tools,
            sandbox: checkout_sandbox,
            provided_env: IndexMap::new(),
            provided_tools: IndexMap::new(),
            provided_deps: Vec::new(),
            provided_sandbox: None,
            variant_id: checkout_variant,
            result_id: checkout_result_id,
            deterministic: checkout_deterministic,
            is_valid: checkout_is_valid,
        }));
        let checkout_ref = CoreRef::leaf(CoreTarget::Step(checkout_step_id), checkout_variant, checkout_is_valid, checkout_deterministic, recipe_name);

        let build_step_id = if recipe.step_is_valid(StepKind::Build) {
            let build_sandbox = extract_sandbox(&acc.sandbox);
            let build_strong: Vec<String> = recipe.vars.build.iter().cloned().collect();
            let mut build_names = build_strong.clone();
            build_names.extend(recipe.vars_weak.build.iter().cloned());
            let build_digest_env = acc.env.filter(&build_strong)?;
            let build_env_view = acc.env.filter(&build_names)?;
            let build_tools = toolset_to_map(&acc.tools.retain_named(&recipe.tools.build));
            let build_digest_script = recipe
                .digest_script(StepKind::Build)
                .map(|s| build_digest_env.substitute(s, &format!("{recipe_name}:buildScript#digest")))
                .transpose()?;
            let build_script = recipe
                .script(StepKind::Build)
                .map(|s| build_env_view.substitute(s, &format!("{recipe_name}:buildScript")))
                .transpose()?;
            let mut build_args = vec![checkout_ref.clone()];
            build_args.extend(acc.args.iter().cloned());
            let build_variant = compute_variant_id(&VariantIdInputs {
                fingerprinted,
                sandbox: build_sandbox.as_ref(),
                digest_script: build_digest_script.as_deref(),
                tools: &build_tools,
                digest_env: &env_to_map(&build_digest_env),
                args: &build_args,
            });
            let build_deterministic = checkout_deterministic && build_args.iter().all(|a| a.deterministic);
            let build_result_id = compute_result_id(build_variant, &IndexMap::new(), &IndexMap::new(), &[], None);
            Some(StepId(self.steps.push(CoreStep {
                kind: StepKind::Build,
                package: PackageId(0),
                digest_env: env_to_map(&build_digest_env),
                env: env_to_map(&build_env_view),
                script: build_script,
                digest_script: build_digest_script,
                args: build_args,
                tools: build_tools,
                sandbox: build_sandbox,
                provided_env: IndexMap::new(),
                provided_tools: IndexMap::new(),
                provided_deps: Vec::new(),
                provided_sandbox: None,
                variant_id: build_variant,
                result_id: build_result_id,
                deterministic: build_deterministic,
                is_valid: true,
            })))
        } else {
            None
        };

        let package_arg = match build_step_id {
            Some(id) => {
                let step = self.steps.get(id.0);
                CoreRef::leaf(CoreTarget::Step(id), step.variant_id, true, step.deterministic, recipe_name)
            }
            None => checkout_ref.clone(),
        };
        let package_deterministic = package_arg.deterministic;

        if recipe.shared && !package_deterministic {
            return Err(ErrorKind::NonDeterministicShared { name: recipe_name.to_string() }.into());
        }

        let package_sandbox = extract_sandbox(&acc.sandbox);
        let package_strong: Vec<String> = recipe.vars.package.iter().cloned().collect();
        let mut package_names = package_strong.clone();
        package_names.extend(recipe.vars_weak.package.iter().cloned());
        let package_digest_env = acc.env.filter(&package_strong)?;
        let package_env_view = acc.env.filter(&package_names)?;
        let package_tools = toolset_to_map(&acc.tools.retain_named(&recipe.tools.package));
        let package_digest_script = Some(package_digest_env.substitute(
            recipe.digest_script(StepKind::Package).unwrap_or(""),
            &format!("{recipe_name}:packageScript#digest"),
        )?);
        let package_script = Some(package_env_view.substitute(
            recipe.script(StepKind::Package).unwrap_or(""),
            &format!("{recipe_name}:packageScript"),
        )?);
        let package_args = vec![package_arg];
        let package_variant = compute_variant_id(&VariantIdInputs {
            fingerprinted,
            sandbox: package_sandbox.as_ref(),
            digest_script: package_digest_script.as_deref(),
            tools: &package_tools,
            digest_env: &env_to_map(&package_digest_env),
            args: &package_args,
        });

        let pkg_id = PackageId(self.packages.len() as u32);
        let package_step_id = StepId(self.steps.push(CoreStep {
            kind: StepKind::Package,
            package: pkg_id,
            digest_env: env_to_map(&package_digest_env),
            env: env_to_map(&package_env_view),
            script: package_script,
            digest_script: package_digest_script,
            args: package_args,
            tools: package_tools,
            sandbox: package_sandbox,
            provided_env: IndexMap::new(),
            provided_tools: IndexMap::new(),
            provided_deps: Vec::new(),
            provided_sandbox: None,
            variant_id: package_variant,
            result_id: package_variant,
            deterministic: package_deterministic,
            is_valid: true,
        }));
        {
            let checkout_step = self.steps.get_mut(checkout_step_id.0);
            checkout_step.package = pkg_id;
        }
        if let Some(id) = build_step_id {
            let build_step = self.steps.get_mut(id.0);
            build_step.package = pkg_id;
        }

        let self_ref = CoreRef::leaf(CoreTarget::Step(package_step_id), package_variant, true, package_deterministic, recipe_name);

        let provided_env: IndexMap<String, String> = recipe
            .provided_env
            .iter()
            .map(|(k, v)| Ok::<_, EnvError>((k.clone(), acc.env.substitute(v, &format!("{recipe_name}:provideVars[{k}]"))?)))
            .collect::<std::result::Result<_, EnvError>>()?;

        let mut provided_tools_map: IndexMap<String, CoreTool> = IndexMap::new();
        for (name, tmpl) in &recipe.provided_tools {
            provided_tools_map.insert(name.clone(), instantiate_tool(&acc.env, recipe_name, name, tmpl, self_ref.clone())?);
        }

        let provided_sandbox = recipe
            .provided_sandbox
            .as_ref()
            .map(|tmpl| instantiate_sandbox(&acc.env, recipe_name, tmpl, self_ref.clone()))
            .transpose()?;

        let provided_deps_vec: Vec<CoreRef> = acc.provided_deps.values().cloned().collect();

        let result_id = compute_result_id(package_variant, &provided_env, &provided_tools_map, &provided_deps_vec, provided_sandbox.as_ref());
        {
            let step = self.steps.get_mut(package_step_id.0);
            step.provided_env = provided_env;
            step.provided_tools = provided_tools_map;
            step.provided_deps = provided_deps_vec;
            step.provided_sandbox = provided_sandbox;
            step.result_id = result_id;
        }

        let internal_ref = CoreRef::leaf(CoreTarget::Step(package_step_id), package_variant, true, package_deterministic, recipe_name)
            .with_overlay(acc.diff_tools.clone(), acc.diff_sandbox.clone());

        let core_package = CorePackage {
            pkg_id,
            recipe_name: recipe.name.clone(),
            tools: toolset_to_map(&acc.tools),
            sandbox: extract_sandbox(&acc.sandbox),
            direct_dep_steps: acc.args.clone(),
            indirect_dep_steps,
            states: acc.states,
            fingerprint_mask,
            checkout_step: checkout_step_id,
            build_step: build_step_id,
            package_step: package_step_id,
            internal_ref,
        };
        let pushed = self.packages.push(core_package);
        debug_assert_eq!(pushed, pkg_id.0);

        let recipe_result_index = self.result_index.entry(recipe_name.to_string()).or_default();
        let final_pkg_id = match recipe_result_index.get(&result_id) {
            Some(existing) => *existing,
            None => {
                recipe_result_index.insert(result_id, pkg_id);
                pkg_id
            }
        };

        let mut subtree = acc.subtree;
        subtree.insert(recipe_name.to_string());

        self.matchers.entry(recipe_name.to_string()).or_default().push(PackageMatcher::capture(
            final_pkg_id,
            &input_env,
            &input_tools,
            &acc.dep_states,
            input_sandbox.as_ref(),
            subtree.clone(),
        ));

        Ok((final_pkg_id, subtree))
    }

    fn process_dependency(&mut self, recipe_name: &str, recipe: &Recipe, dep: &Dependency, stack: &IndexSet<String>, acc: &mut Accum) -> Result<()> {
        if let Some(cond) = &dep.condition {
            let args = fun_args(recipe_name, acc.sandbox_enabled, &acc.tools);
            let ok = acc
                .env
                .evaluate_with(cond, &format!("{recipe_name}:depends[{}]:if", dep.recipe), &args)
                .map_err(|source| ErrorKind::Condition { recipe: recipe_name.to_string(), expr: cond.clone(), source })?;
            if !ok {
                return Ok(());
            }
        }

        let mut child_env = acc.dep_env.derive();
        for (k, v) in &dep.env_override {
            let value = child_env.substitute(v, &format!("{recipe_name}:depends[{}]:environment", dep.recipe))?;
            child_env.set(k.clone(), value);
        }

        let (child_pkg_id, child_subtree) = self
            .prepare(
                &dep.recipe,
                child_env,
                acc.sandbox_enabled,
                acc.dep_states.clone(),
                acc.dep_sandbox.clone(),
                acc.dep_tools.derive(),
                stack,
            )
            .map_err(|e| e.with_frame(recipe_name, format!("depends[{}]", dep.recipe)))?;
        acc.subtree.extend(child_subtree);

        let child_step_id = self.packages.get(child_pkg_id.0).package_step;
        let child_step = self.steps.get(child_step_id.0);
        let child_variant = child_step.variant_id;
        let child_valid = child_step.is_valid;
        let child_det = child_step.deterministic;
        let child_provided_env = child_step.provided_env.clone();
        let child_provided_tools = child_step.provided_tools.clone();
        let child_provided_deps = child_step.provided_deps.clone();
        let child_provided_sandbox = child_step.provided_sandbox.clone();

        match acc.seen_dep_variants.get(&dep.recipe) {
            Some(prev) if *prev != child_variant => {
                return Err(ErrorKind::IncompatibleDependency { caller: recipe_name.to_string(), dep: dep.recipe.clone() }.into());
            }
            Some(_) => {
                if self.ctx.recipes.policies.unique_dependency {
                    return Err(ErrorKind::IncompatibleDependency { caller: recipe_name.to_string(), dep: dep.recipe.clone() }.into());
                }
                self.warn_once.warn(
                    format!("dup-dep:{recipe_name}:{}", dep.recipe),
                    format!("recipe '{recipe_name}' depends on '{}' more than once", dep.recipe),
                );
            }
            None => {
                acc.seen_dep_variants.insert(dep.recipe.clone(), child_variant);
            }
        }

        let dep_ref = CoreRef::leaf(CoreTarget::Step(child_step_id), child_variant, child_valid, child_det, dep.recipe.clone())
            .with_overlay(acc.diff_tools.clone(), acc.diff_sandbox.clone());

        let child_states = self.packages.get(child_pkg_id.0).states.clone();

        for use_kind in &dep.use_set {
            match use_kind {
                UseKind::Environment => {
                    for (k, v) in &child_provided_env {
                        acc.env.set(k.clone(), v.clone());
                        if dep.forward {
                            acc.dep_env.set(k.clone(), v.clone());
                        }
                    }
                }
                UseKind::Tools => {
                    for (name, tool) in &child_provided_tools {
                        let tool_ref = CoreRef::leaf(
                            CoreTarget::Tool(Box::new(tool.clone())),
                            tool.package_step.variant_id,
                            true,
                            tool.package_step.deterministic,
                            dep.recipe.clone(),
                        );
                        acc.tools.set(name.clone(), tool_ref.clone());
                        acc.diff_tools.insert(name.clone(), Some(tool_ref.clone()));
                        if dep.forward {
                            acc.dep_tools.set(name.clone(), tool_ref);
                        }
                    }
                }
                UseKind::Sandbox => {
                    if let Some(sandbox) = &child_provided_sandbox {
                        let sandbox_ref = CoreRef::leaf(
                            CoreTarget::Sandbox(Box::new(sandbox.clone())),
                            sandbox.package_step.variant_id,
                            true,
                            sandbox.package_step.deterministic,
                            dep.recipe.clone(),
                        );
                        acc.sandbox = Some(sandbox_ref.clone());
                        acc.diff_sandbox = DiffSandbox::Replace(Box::new(sandbox_ref.clone()));
                        if acc.sandbox_enabled {
                            for (k, v) in &sandbox.environment {
                                acc.env.set(k.clone(), v.clone());
                            }
                        }
                        if dep.forward {
                            acc.dep_sandbox = Some(sandbox_ref);
                        }
                    }
                }
                UseKind::Deps => {
                    acc.indirect.extend(child_provided_deps.iter().cloned());
                }
                UseKind::Result => {
                    if acc.seen_result_names.insert(dep.recipe.clone()) {
                        acc.args.push(dep_ref.clone());
                    }
                }
            }
        }

        for state_name in &dep.use_states {
            if let Some(state) = acc.states.get_mut(state_name.as_str()) {
                if let Some(child_state) = child_states.get(state_name.as_str()) {
                    state.on_use(child_state.as_ref());
                }
            }
        }

        if recipe.provide_deps.iter().any(|n| n == &dep.recipe) {
            match acc.provided_deps.get(&dep.recipe) {
                Some(existing) if existing.variant_id != dep_ref.variant_id => {
                    return Err(ErrorKind::IncompatibleProvidedDep { recipe: recipe_name.to_string(), name: dep.recipe.clone() }.into());
                }
                Some(_) => {}
                None => {
                    acc.provided_deps.insert(dep.recipe.clone(), dep_ref.clone());
                    for extra in &child_provided_deps {
                        acc.provided_deps.entry(extra.source_recipe.clone()).or_insert_with(|| extra.clone());
                    }
                }
            }
        }

        for nested in &dep.depends {
            self.process_dependency(recipe_name, recipe, nested, stack, acc)?;
        }

        Ok(())
    }

    /// Walk `from`'s transitive `args` into a DAG keyed by variant-id, the convenience view over
    /// one package's step graph (§4.7). Edges point from a step to the upstream steps its args
    /// name.
    pub fn topological_order(&self, from: StepId) -> Dag<Digest> {
        let mut dag: Dag<Digest> = Dag::new();
        let mut stack = vec![from];
        let mut seen = IndexSet::new();
        while let Some(id) = stack.pop() {
            let step = self.steps.get(id.0);
            if !seen.insert(step.variant_id) {
                continue;
            }
            let step_idx = dag.add_node_or_get_index(step.variant_id);
            for arg in &step.args {
                if let Some(arg_id) = arg.step_id() {
                    let arg_step = self.steps.get(arg_id.0);
                    let arg_idx = dag.add_node_or_get_index(arg_step.variant_id);
                    let _ = dag.add_edge(step_idx, arg_idx);
                    stack.push(arg_id);
                }
            }
        }
        dag
    }
}

fn filter_env(env: &Env, list: &GlobList) -> Result<Env> {
    let included = if list.include.is_empty() { env.clone() } else { env.filter(&list.include)? };
    let result = if list.exclude.is_empty() { included } else { included.prune(&list.exclude)? };
    Ok(result)
}

fn filter_tools(tools: &ToolSet, list: &GlobList) -> Result<ToolSet, anvil_env::EnvError> {
    let included = if list.include.is_empty() {
        tools.clone()
    } else {
        tools.filter(&list.include).map_err(to_env_error)?
    };
    let result = if list.exclude.is_empty() { included } else { included.prune(&list.exclude).map_err(to_env_error)? };
    Ok(result)
}

fn to_env_error(source: globset::Error) -> anvil_env::EnvError {
    anvil_env::EnvError::Glob { pattern: String::new(), source }
}

fn env_to_map(env: &Env) -> IndexMap<String, String> {
    env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn toolset_to_map(tools: &ToolSet) -> IndexMap<String, CoreTool> {
    tools
        .iter()
        .filter_map(|(k, r)| match &r.target {
            CoreTarget::Tool(t) => Some((k.to_string(), (**t).clone())),
            _ => None,
        })
        .collect()
}

fn extract_sandbox(sandbox: &Option<CoreRef>) -> Option<CoreSandbox> {
    match sandbox {
        Some(core_ref) => match &core_ref.target {
            CoreTarget::Sandbox(s) => Some((**s).clone()),
            _ => None,
        },
        None => None,
    }
}

fn apply_env_layers(env: &mut Env, layers: &[IndexMap<String, String>], diag: &str) -> Result<()> {
    for layer in layers {
        for (k, v) in layer {
            let value = env.substitute(v, diag)?;
            env.set(k.clone(), value);
        }
    }
    Ok(())
}

/// Build the context `is-sandbox-enabled`/`is-tool` (and any other tool/sandbox-aware string
/// function) need, from the state `prepare` is currently accumulating.
fn fun_args(recipe_name: &str, sandbox_enabled: bool, tools: &ToolSet) -> FunArgs {
    FunArgs {
        recipe_name: Some(recipe_name.to_string()),
        sandbox_enabled,
        tool_names: tools.iter().map(|(name, _)| name.to_string()).collect(),
    }
}

/// Merge every tool's `environment` map into `env`, erroring if two distinct tools define the
/// same variable name.
fn apply_tool_environments(recipe_name: &str, tools: &ToolSet, env: &mut Env) -> Result<()> {
    let mut sorted: Vec<(&str, &CoreTool)> = tools
        .iter()
        .filter_map(|(name, r)| match &r.target {
            CoreTarget::Tool(t) => Some((name, t.as_ref())),
            _ => None,
        })
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut owner: IndexMap<String, String> = IndexMap::new();
    let mut merged: IndexMap<String, String> = IndexMap::new();
    for (name, tool) in sorted {
        for (k, v) in &tool.environment {
            if let Some(existing_owner) = owner.get(k) {
                if existing_owner != name {
                    return Err(ErrorKind::DuplicateToolEnv { recipe: recipe_name.to_string(), name: k.clone() }.into());
                }
            }
            owner.insert(k.clone(), name.to_string());
            merged.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in merged {
        env.set(k, v);
    }
    Ok(())
}

/// One bit per tool (sorted by name) plus a high bit for the recipe's own `fingerprint` scripts.
/// `Maybe` bits resolve to whatever any definite (`always`/expression) bit in this recipe resolved
/// to, matching the "maybe participates only if something else definitely does" rule.
fn compute_fingerprint_mask(recipe_name: &str, recipe: &Recipe, tools: &ToolSet, env: &Env, sandbox_enabled: bool) -> Result<u64> {
    let args = fun_args(recipe_name, sandbox_enabled, tools);
    let mut sorted: Vec<(&str, &CoreTool)> = tools
        .iter()
        .filter_map(|(name, r)| match &r.target {
            CoreTarget::Tool(t) => Some((name, t.as_ref())),
            _ => None,
        })
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut bits: Vec<Option<bool>> = Vec::with_capacity(sorted.len());
    for (_, tool) in &sorted {
        let resolved = match &tool.fingerprint_if {
            anvil_recipe::FingerprintIf::Always(_) => Some(true),
            anvil_recipe::FingerprintIf::Expr(expr) => Some(env.evaluate_with(expr, &format!("{recipe_name}:fingerprintIf"), &args)?),
            anvil_recipe::FingerprintIf::Maybe => None,
        };
        bits.push(resolved);
    }

    let mut own_bit: Option<bool> = None;
    for fs in &recipe.fingerprint_scripts {
        match &fs.fingerprint_if {
            anvil_recipe::FingerprintIf::Always(_) => own_bit = Some(true),
            anvil_recipe::FingerprintIf::Expr(expr) => {
                let v = env.evaluate_with(expr, &format!("{recipe_name}:fingerprintIf"), &args)?;
                own_bit = Some(own_bit.unwrap_or(false) || v);
            }
            anvil_recipe::FingerprintIf::Maybe => {}
        }
    }

    let any_definite = bits.iter().any(|b| *b == Some(true)) || own_bit == Some(true);

    let mut mask: u64 = 0;
    for (i, bit) in bits.iter().enumerate() {
        let resolved = bit.unwrap_or(any_definite);
        if resolved && i < 63 {
            mask |= 1 << i;
        }
    }
    let own_resolved = own_bit.unwrap_or(any_definite);
    if own_resolved {
        mask |= 1 << 63;
    }
    Ok(mask)
}

fn instantiate_tool(env: &Env, recipe_name: &str, name: &str, tmpl: &AbstractTool, self_ref: CoreRef) -> Result<CoreTool> {
    let diag = format!("{recipe_name}:provideTools[{name}]");
    let environment: IndexMap<String, String> = tmpl
        .environment
        .iter()
        .map(|(k, v)| Ok::<_, EnvError>((k.clone(), env.substitute(v, &diag)?)))
        .collect::<std::result::Result<_, EnvError>>()?;
    Ok(CoreTool {
        package_step: self_ref,
        path: env.substitute(&tmpl.path, &diag)?,
        libs: tmpl.libs.iter().map(|l| env.substitute(l, &diag)).collect::<std::result::Result<_, EnvError>>()?,
        net_access: tmpl.net_access,
        environment,
        fingerprint_script: tmpl.fingerprint_script.clone(),
        fingerprint_if: tmpl.fingerprint_if.clone(),
    })
}

fn instantiate_sandbox(env: &Env, recipe_name: &str, tmpl: &SandboxTemplate, self_ref: CoreRef) -> Result<CoreSandbox> {
    let diag = format!("{recipe_name}:provideSandbox");
    let environment: IndexMap<String, String> = tmpl
        .environment
        .iter()
        .map(|(k, v)| Ok::<_, EnvError>((k.clone(), env.substitute(v, &diag)?)))
        .collect::<std::result::Result<_, EnvError>>()?;
    Ok(CoreSandbox {
        package_step: self_ref,
        enabled: true,
        paths: tmpl.paths.iter().map(|p| env.substitute(p, &diag)).collect::<std::result::Result<_, EnvError>>()?,
        mounts: tmpl.mounts.clone(),
        environment,
    })
}

/// Dedup `refs` by `source_recipe`, erroring if two entries share a name with different variants.
fn dedup_by_source(refs: &[CoreRef], recipe_name: &str) -> Result<Vec<CoreRef>> {
    let mut by_name: IndexMap<String, CoreRef> = IndexMap::new();
    for r in refs {
        match by_name.get(&r.source_recipe) {
            Some(existing) if existing.variant_id != r.variant_id => {
                return Err(ErrorKind::IncompatibleDependency { caller: recipe_name.to_string(), dep: r.source_recipe.clone() }.into());
            }
            Some(_) => {}
            None => {
                by_name.insert(r.source_recipe.clone(), r.clone());
            }
        }
    }
    Ok(by_name.into_values().collect())
}
