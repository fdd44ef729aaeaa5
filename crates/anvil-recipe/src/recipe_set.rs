// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! `RecipeSet`: loads a project's `recipes/**/*.yaml` and `classes/**/*.yaml` tree, expands
//! `multiPackage` documents, resolves class inheritance for every recipe, and synthesises the
//! virtual root that anchors a full-project elaboration.
//!
//! Loading is parametrised over [`SourceTree`] rather than calling `std::fs` directly, the same
//! way [`crate::Policies`] is passed in rather than read from the environment: a host process
//! (the out-of-scope CLI) owns the real filesystem walk and config parsing, `RecipeSet` only
//! needs *a* tree to read from. This also means the end-to-end scenarios in `anvil-core`'s test
//! suite can drive a full `RecipeSet::populate` without touching a disk.

use std::collections::HashSet;

use indexmap::IndexMap;
use thiserror::Error;

use anvil_digest::DigestHasher;
use anvil_env::{FileLoader, IncludeHelper, IncludeHelperError};

use crate::{
    layer::{load_layered_config, LayerError},
    policy::Policies,
    resolve::{resolve_classes, ResolveError},
    schema::{ClassFragment, Dependency, KeyValue, UseKind, STEP_KINDS},
    Recipe,
};

/// The name of the synthetic recipe every root recipe hangs off of.
pub const VIRTUAL_ROOT_NAME: &str = "";

/// Abstracts "a directory tree of YAML files" so `RecipeSet` can be loaded from a real project
/// checkout or from an in-memory fixture.
pub trait SourceTree {
    /// List every `*.yaml` file found recursively under `dir`, as paths relative to `dir` using
    /// `/` separators (e.g. `"compilers/gcc.yaml"`), in a deterministic (lexicographic) order.
    /// Returns an empty list if `dir` does not exist.
    fn list_yaml(&self, dir: &str) -> std::io::Result<Vec<String>>;

    /// List every file (any extension) found recursively under `dir`, as paths relative to `dir`
    /// using `/` separators, in a deterministic (lexicographic) order. Returns an empty list if
    /// `dir` does not exist. Used to resolve `$<'...'>`/`$<<...>>` glob patterns.
    fn list_all(&self, dir: &str) -> std::io::Result<Vec<String>>;

    /// Read the full contents of `path` (relative to the tree root).
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
}

/// A [`SourceTree`] backed by a real directory on disk.
pub struct FsTree {
    root: std::path::PathBuf,
}

impl FsTree {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Collect every file (any extension) recursively under `dir`, as paths relative to
    /// `self.root`.
    fn walk(&self, dir: &std::path::Path, out: &mut Vec<String>) -> std::io::Result<()> {
        let mut entries: Vec<_> = match fs_err::read_dir(dir) {
            Ok(rd) => rd.collect::<Result<Vec<_>, _>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, out)?;
            } else {
                let rel = path.strip_prefix(&self.root).unwrap_or(&path);
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    fn list_under(&self, dir: &str) -> std::io::Result<Vec<String>> {
        let base = self.root.join(dir);
        let mut out = Vec::new();
        self.walk(&base, &mut out)?;
        let prefix = format!("{dir}/");
        out.iter_mut().for_each(|p| {
            if let Some(stripped) = p.strip_prefix(&prefix) {
                *p = stripped.to_string();
            }
        });
        out.sort();
        Ok(out)
    }
}

impl SourceTree for FsTree {
    fn list_yaml(&self, dir: &str) -> std::io::Result<Vec<String>> {
        let mut out = self.list_under(dir)?;
        out.retain(|p| p.ends_with(".yaml"));
        Ok(out)
    }

    fn list_all(&self, dir: &str) -> std::io::Result<Vec<String>> {
        self.list_under(dir)
    }

    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        fs_err::read(self.root.join(path)).map_err(Into::into)
    }
}

#[derive(Debug, Error)]
pub enum RecipeSetError {
    #[error("reading '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing '{path}'")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error("recipe path component '{component}' in '{name}' does not match ^[0-9A-Za-z_.+-]+$")]
    InvalidRecipeName { name: String, component: String },
    #[error("recipe '{recipe}': variable name '{name}' is not a valid identifier or starts with the reserved BOB_ prefix")]
    InvalidVarName { recipe: String, name: String },
    #[error("duplicate recipe name '{name}'")]
    DuplicateRecipe { name: String },
    #[error("recipe '{recipe}': checkoutSCM directory '{path}' must be relative")]
    AbsoluteScmPath { recipe: String, path: String },
    #[error("recipe '{recipe}': checkoutSCM directories '{a}' and '{b}' overlap")]
    ScmOverlap { recipe: String, a: String, b: String },
    #[error("recipe '{recipe}': resolving $<'...'>/$<<...>> includes")]
    Include {
        recipe: String,
        #[source]
        source: IncludeHelperError,
    },
}

/// A loaded, fully class-resolved project: every recipe (plus the synthetic virtual root) ready
/// to be handed to `anvil_core::Elaborator`.
#[derive(Debug, Clone)]
pub struct RecipeSet {
    pub recipes: IndexMap<String, Recipe>,
    pub policies: Policies,
    /// Plugin names collected from `config.yaml`'s `plugins` list across every layer, root-first,
    /// deduplicated. Plugin *execution* stays out of scope (see [`crate::Recipe::plugin_properties`]
    /// and [`anvil_core::PluginState`]); this is only the registry a host process would consult to
    /// decide which plugin implementations to load.
    pub plugins: Vec<String>,
    /// SHA1 of every `classes/**/*.yaml` and `recipes/**/*.yaml` file consumed while building this
    /// set, keyed by path. Feeds the persistence cache key (§6): a host process hashes this table
    /// the same way `process_includes` hashes an included file, so a change to any recipe or class
    /// invalidates a stale on-disk cache even though `RecipeSet` itself holds no cache state.
    pub file_digests: IndexMap<String, [u8; anvil_digest::HASH_LEN]>,
}

impl RecipeSet {
    /// Load a full project: the root `config.yaml` and every `layers/<name>/config.yaml` it names
    /// (§4.4), recursively, then `populate` the combined policy set. A sub-layer that sets a
    /// policy already settled by an ancestor to a conflicting value is rejected.
    pub fn populate_project(tree: &dyn SourceTree, root_filter: &crate::schema::GlobList) -> Result<Self, RecipeSetError> {
        let loaded = load_layered_config(tree)?;
        let mut set = Self::populate(tree, loaded.policies, root_filter)?;
        set.plugins = loaded.plugins;
        Ok(set)
    }

    /// Load `classes/**/*.yaml` and `recipes/**/*.yaml` from `tree`, resolve every recipe's class
    /// chain, validate names, and append the virtual root depending on every `root: true` recipe
    /// not excluded by `root_filter` (an empty filter excludes nothing).
    pub fn populate(tree: &dyn SourceTree, policies: Policies, root_filter: &crate::schema::GlobList) -> Result<Self, RecipeSetError> {
        let mut file_digests = IndexMap::new();
        let mut classes = load_fragments(tree, "classes", &mut file_digests)?;
        log::debug!("loaded {} class(es)", classes.len());

        let mut pending: Vec<(String, String, ClassFragment)> = Vec::new();
        for path in tree.list_yaml("recipes").map_err(|source| RecipeSetError::Io {
            path: "recipes".to_string(),
            source,
        })? {
            let base_name = strip_yaml(&path);
            log::debug!("discovered recipe '{base_name}' at recipes/{path}");
            let full_path = format!("recipes/{path}");
            let bytes = tree.read(&full_path).map_err(|source| RecipeSetError::Io {
                path: path.clone(),
                source,
            })?;
            file_digests.insert(full_path, anvil_digest::sha1_bytes(&bytes));
            let doc = ClassFragment::from_yaml(&bytes).map_err(|source| RecipeSetError::Yaml { path, source })?;
            expand_into(&base_name, doc, &mut classes, &mut pending);
        }

        let mut recipes = IndexMap::new();
        for (name, base_name, fragment) in pending {
            validate_recipe_name(&name)?;
            log::debug!("resolving classes for '{name}'");
            let mut recipe = resolve_classes(&name, &base_name, &fragment, &classes, &policies)?;
            process_includes(tree, &policies, &mut recipe)?;
            validate_vars(&recipe)?;
            validate_scm(&recipe)?;
            if recipes.insert(name.clone(), recipe).is_some() {
                return Err(RecipeSetError::DuplicateRecipe { name });
            }
        }

        let root_names: Vec<String> = recipes
            .values()
            .filter(|r| r.root)
            .filter(|r| passes_filter(root_filter, &r.name))
            .map(|r| r.name.clone())
            .collect();
        recipes.insert(VIRTUAL_ROOT_NAME.to_string(), virtual_root(&root_names));

        Ok(Self {
            recipes,
            policies,
            plugins: Vec::new(),
            file_digests,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(name)
    }

    pub fn virtual_root(&self) -> &Recipe {
        &self.recipes[VIRTUAL_ROOT_NAME]
    }
}

fn passes_filter(filter: &crate::schema::GlobList, name: &str) -> bool {
    if filter.include.is_empty() && filter.exclude.is_empty() {
        return true;
    }
    let included = filter.include.is_empty()
        || filter.include.iter().any(|p| glob_match(p, name));
    let excluded = filter.exclude.iter().any(|p| glob_match(p, name));
    included && !excluded
}

fn glob_match(pattern: &str, name: &str) -> bool {
    globset::Glob::new(pattern).map(|g| g.compile_matcher().is_match(name)).unwrap_or(false)
}

fn virtual_root(root_names: &[String]) -> Recipe {
    let depends = root_names
        .iter()
        .map(|name| Dependency {
            recipe: name.clone(),
            env_override: Default::default(),
            forward: false,
            use_set: indexmap::IndexSet::from([UseKind::Result]),
            use_states: Default::default(),
            condition: None,
            depends: Vec::new(),
        })
        .collect();
    let fragment = ClassFragment {
        depends,
        ..Default::default()
    };
    resolve_classes(VIRTUAL_ROOT_NAME, VIRTUAL_ROOT_NAME, &fragment, &IndexMap::new(), &Policies::default())
        .expect("virtual root never references a class or provideDeps pattern")
}

fn load_fragments(
    tree: &dyn SourceTree,
    dir: &str,
    file_digests: &mut IndexMap<String, [u8; anvil_digest::HASH_LEN]>,
) -> Result<IndexMap<String, ClassFragment>, RecipeSetError> {
    let mut out = IndexMap::new();
    for path in tree.list_yaml(dir).map_err(|source| RecipeSetError::Io {
        path: dir.to_string(),
        source,
    })? {
        let name = strip_yaml(&path);
        let full_path = format!("{dir}/{path}");
        let bytes = tree.read(&full_path).map_err(|source| RecipeSetError::Io {
            path: path.clone(),
            source,
        })?;
        file_digests.insert(full_path, anvil_digest::sha1_bytes(&bytes));
        let fragment = ClassFragment::from_yaml(&bytes).map_err(|source| RecipeSetError::Yaml { path, source })?;
        out.insert(name, fragment);
    }
    Ok(out)
}

/// Adapts a [`SourceTree`] into the [`FileLoader`] `$<'...'>`/`$<<...>>` expansion needs, rooted
/// at `base` (a recipe's own directory under `relative_includes`, or the project root otherwise).
struct TreeLoader<'a> {
    tree: &'a dyn SourceTree,
    base: String,
}

impl<'a> TreeLoader<'a> {
    fn resolve(&self, path: &str) -> String {
        if self.base.is_empty() {
            path.to_string()
        } else {
            format!("{}/{path}", self.base)
        }
    }
}

impl<'a> FileLoader for TreeLoader<'a> {
    fn glob(&self, pattern: &str) -> std::io::Result<Vec<String>> {
        let matcher = globset::Glob::new(pattern)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?
            .compile_matcher();
        let candidates = self.tree.list_all(&self.base)?;
        Ok(candidates.into_iter().filter(|p| matcher.is_match(p)).collect())
    }

    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        self.tree.read(&self.resolve(path))
    }

    /// Write the included file's (already resolved, possibly multi-match concatenated) content out
    /// to a content-addressed path under the system temp directory so a `$<<path>>` expansion has a
    /// real filesystem path to reference.
    fn materialize(&self, content: &[u8]) -> std::io::Result<String> {
        let digest = anvil_digest::Digest::Short(anvil_digest::sha1_bytes(content));
        let tmp = std::env::temp_dir().join(format!("anvil-include-{}", digest.to_hex()));
        fs_err::write(&tmp, content)?;
        Ok(tmp.to_string_lossy().into_owned())
    }
}

/// Expand `$<'path'>`/`$<<path>>` forms in each of `recipe`'s scripts, folding the content of
/// every included file into the matching `digestScript` so a step's Variant-Id changes whenever an
/// included file's content does (§4.3). `scripts` themselves are rewritten in place with the
/// expanded text so the runnable form never carries a raw include directive through to execution.
fn process_includes(tree: &dyn SourceTree, policies: &Policies, recipe: &mut Recipe) -> Result<(), RecipeSetError> {
    let base = if policies.relative_includes {
        recipe.base_name.rsplit_once("::").map(|(dir, _)| dir.replace("::", "/")).unwrap_or_default()
    } else {
        String::new()
    };
    let loader = TreeLoader { tree, base: format!("recipes/{base}").trim_end_matches('/').to_string() };

    for kind in STEP_KINDS {
        let Some(script) = recipe.scripts.get(kind).clone() else { continue };
        let mut helper = IncludeHelper::new(&loader);
        let expanded = helper.process(&script).map_err(|source| RecipeSetError::Include {
            recipe: recipe.name.clone(),
            source,
        })?;

        let mut digest_text = expanded.clone();
        if helper.included_paths().next().is_some() {
            let mut hasher = DigestHasher::new();
            helper.fingerprint_into(&mut hasher);
            digest_text.push_str("\n# anvil-include: ");
            digest_text.push_str(&hasher.finish().to_hex());
        }

        *recipe.scripts.get_mut(kind) = Some(expanded);
        if recipe.digest_scripts.get(kind).is_some() {
            *recipe.digest_scripts.get_mut(kind) = Some(digest_text);
        }
    }
    Ok(())
}

fn strip_yaml(path: &str) -> String {
    path.strip_suffix(".yaml").unwrap_or(path).replace('/', "::")
}

/// Expand a `multiPackage` document into its sibling recipes, registering the synthesised
/// anonymous base class in `classes` and appending `(name, base_name, fragment)` triples (each
/// already `inherit`ing the anonymous class) to `pending`. A document with no `multiPackage`
/// block is a single recipe passed through unchanged.
fn expand_into(
    base_name: &str,
    doc: ClassFragment,
    classes: &mut IndexMap<String, ClassFragment>,
    pending: &mut Vec<(String, String, ClassFragment)>,
) {
    if doc.multi_package.is_empty() {
        pending.push((base_name.to_string(), base_name.to_string(), doc));
        return;
    }
    let anon_name = format!("{base_name}::__multiPackage__");
    let subs: Vec<KeyValue<ClassFragment>> = doc.multi_package.clone();
    let mut anon = doc;
    anon.multi_package.clear();
    classes.insert(anon_name.clone(), anon);

    for KeyValue { key, mut value } in subs {
        value.inherit.insert(0, anon_name.clone());
        let name = format!("{base_name}::{key}");
        pending.push((name, base_name.to_string(), value));
    }
}

fn validate_recipe_name(name: &str) -> Result<(), RecipeSetError> {
    if name.is_empty() {
        return Ok(());
    }
    for component in name.split("::") {
        if component.is_empty() || !component.chars().all(|c| c.is_ascii_alphanumeric() || "_.+-".contains(c)) {
            return Err(RecipeSetError::InvalidRecipeName {
                name: name.to_string(),
                component: component.to_string(),
            });
        }
    }
    Ok(())
}

fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    first_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with("BOB_")
}

fn validate_vars(recipe: &Recipe) -> Result<(), RecipeSetError> {
    let names = recipe
        .provided_env
        .keys()
        .chain(recipe.meta_environment.keys())
        .chain(recipe.self_environment.iter().flat_map(|m| m.keys()))
        .chain(recipe.private_environment.iter().flat_map(|m| m.keys()));
    for name in names {
        if !is_valid_var_name(name) {
            return Err(RecipeSetError::InvalidVarName {
                recipe: recipe.name.clone(),
                name: name.clone(),
            });
        }
    }
    Ok(())
}

fn validate_scm(recipe: &Recipe) -> Result<(), RecipeSetError> {
    let mut seen: Vec<&str> = Vec::new();
    for scm in &recipe.checkout_scm {
        if scm.directory.starts_with('/') {
            return Err(RecipeSetError::AbsoluteScmPath {
                recipe: recipe.name.clone(),
                path: scm.directory.clone(),
            });
        }
        for other in &seen {
            if overlaps(&scm.directory, other) {
                return Err(RecipeSetError::ScmOverlap {
                    recipe: recipe.name.clone(),
                    a: scm.directory.clone(),
                    b: (*other).to_string(),
                });
            }
        }
        seen.push(&scm.directory);
    }
    Ok(())
}

/// Two relative paths "overlap" if one is equal to, or a path-component-wise prefix of, the
/// other (e.g. `"src"` and `"src/vendor"` overlap; `"src"` and `"srcdoc"` do not).
fn overlaps(a: &str, b: &str) -> bool {
    let a_parts: Vec<&str> = a.split('/').filter(|s| !s.is_empty()).collect();
    let b_parts: Vec<&str> = b.split('/').filter(|s| !s.is_empty()).collect();
    let n = a_parts.len().min(b_parts.len());
    a_parts[..n] == b_parts[..n]
}
