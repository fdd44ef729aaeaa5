// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! The recipe/class YAML schema. A `.yaml` document under `recipes/` or `classes/` deserialises
//! into a [`ClassFragment`] — every field is optional or empty-default, because a class only ever
//! contributes a *partial* recipe that [`crate::resolve::resolve_classes`] folds into a final,
//! fully-populated [`Recipe`]. The fragment shape and the final shape share most field types so
//! the merge step can move values across without a second conversion layer.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;

/// A bare string or a one-entry mapping, the same ambiguity `stone_recipe::KeyValue<T>` resolves
/// for profiles/sub-packages — here used for anything keyed by name with an inline payload.
#[derive(Debug, Clone)]
pub struct KeyValue<T> {
    pub key: String,
    pub value: T,
}

impl<'de, T> Deserialize<'de> for KeyValue<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map = HashMap::<String, T>::deserialize(deserializer)?;
        map.into_iter()
            .next()
            .map(|(key, value)| KeyValue { key, value })
            .ok_or_else(|| serde::de::Error::custom("expected a single-entry mapping"))
    }
}

pub(crate) fn sequence_of_key_value<'de, T, D>(deserializer: D) -> Result<Vec<KeyValue<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Vec::<KeyValue<T>>::deserialize(deserializer)
}

/// Deserialize a single scalar or a sequence of scalars as a `Vec`, as `stone_recipe` does for
/// `license`.
pub(crate) fn single_as_sequence<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Value<T> {
        Single(T),
        Sequence(Vec<T>),
    }
    Ok(match Value::deserialize(deserializer)? {
        Value::Single(v) => vec![v],
        Value::Sequence(v) => v,
    })
}

/// One of `{checkout, build, package}`, the three step kinds a recipe's scripts and variable sets
/// are split across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Checkout,
    Build,
    Package,
}

pub const STEP_KINDS: [StepKind; 3] = [StepKind::Checkout, StepKind::Build, StepKind::Package];

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Checkout => "checkout",
            StepKind::Build => "build",
            StepKind::Package => "package",
        }
    }
}

/// A value indexed by step kind.
#[derive(Debug, Clone, Default)]
pub struct PerStep<T> {
    pub checkout: T,
    pub build: T,
    pub package: T,
}

impl<T> PerStep<T> {
    pub fn get(&self, kind: StepKind) -> &T {
        match kind {
            StepKind::Checkout => &self.checkout,
            StepKind::Build => &self.build,
            StepKind::Package => &self.package,
        }
    }

    pub fn get_mut(&mut self, kind: StepKind) -> &mut T {
        match kind {
            StepKind::Checkout => &mut self.checkout,
            StepKind::Build => &mut self.build,
            StepKind::Package => &mut self.package,
        }
    }
}

/// A glob-list env/tool/sandbox filter: `!pattern` entries are exclusions, evaluated after the
/// positive matches per `Env::filter`'s contract.
#[derive(Debug, Clone, Default)]
pub struct GlobList {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl GlobList {
    pub fn extend(&mut self, other: &GlobList) {
        self.include.extend(other.include.iter().cloned());
        self.exclude.extend(other.exclude.iter().cloned());
    }
}

impl<'de> Deserialize<'de> for GlobList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        let mut list = GlobList::default();
        for pattern in raw {
            if let Some(negated) = pattern.strip_prefix('!') {
                list.exclude.push(negated.to_string());
            } else {
                list.include.push(pattern);
            }
        }
        Ok(list)
    }
}

/// What a dependency's provides are used for by the depending recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseKind {
    Result,
    Deps,
    Tools,
    Environment,
    Sandbox,
}

/// A single `depends` entry. Recursive: a dependency may itself list sub-dependencies that are
/// only pulled in when this entry is used.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    #[serde(rename = "name")]
    pub recipe: String,
    #[serde(default, rename = "environment")]
    pub env_override: IndexMap<String, String>,
    #[serde(default)]
    pub forward: bool,
    #[serde(default = "default_use_set", rename = "use")]
    pub use_set: IndexSet<UseKind>,
    /// Any additional plugin-state names this dependency is also `use`d for; kept separate from
    /// `UseKind` since the set of plugin names is open-ended and supplied by the plugin registry,
    /// not known to this schema.
    #[serde(default)]
    pub use_states: IndexSet<String>,
    #[serde(rename = "if")]
    pub condition: Option<String>,
    #[serde(default)]
    pub depends: Vec<Dependency>,
}

fn default_use_set() -> IndexSet<UseKind> {
    IndexSet::from([UseKind::Result])
}

/// A tool template as written in a recipe/class; becomes a `CoreTool` once substituted against a
/// concrete package env.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbstractTool {
    pub path: String,
    #[serde(default)]
    pub libs: Vec<String>,
    #[serde(default)]
    pub net_access: bool,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
    pub fingerprint_script: Option<String>,
    #[serde(default)]
    pub fingerprint_if: FingerprintIf,
}

/// The gating condition under which a tool's/recipe's fingerprint script contributes to the
/// fingerprint mask (§4.5's "for each own fingerprintIf, evaluate").
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum FingerprintIf {
    #[default]
    Maybe,
    Always(AlwaysMarker),
    Expr(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "bool")]
pub struct AlwaysMarker;

impl TryFrom<bool> for AlwaysMarker {
    type Error = &'static str;
    fn try_from(v: bool) -> Result<Self, Self::Error> {
        if v {
            Ok(AlwaysMarker)
        } else {
            Err("fingerprintIf: false is not a valid literal, omit the field instead")
        }
    }
}

/// A mount or path entry contributed to the provided sandbox.
#[derive(Debug, Clone, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxTemplate {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
}

/// A checkout SCM entry (`git`, `tarball`, …). The spec only names this as opaque "checkoutSCM
/// list" data with a `directory` field the invariant constrains; kept intentionally generic since
/// no further structure is specified.
#[derive(Debug, Clone, Deserialize)]
pub struct ScmEntry {
    pub kind: String,
    pub directory: String,
    #[serde(flatten)]
    pub fields: IndexMap<String, String>,
}

/// A `fingerprint` script entry: an opaque shell fragment plus the condition gating it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintScript {
    pub script: String,
    #[serde(default)]
    pub fingerprint_if: FingerprintIf,
}

/// The raw YAML shape of one class or recipe document. All fields are optional; merging several
/// of these (per [`crate::resolve::resolve_classes`]) produces a final [`crate::Recipe`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassFragment {
    pub inherit: Vec<String>,
    pub depends: Vec<Dependency>,

    pub env_filter: GlobList,
    pub tools_filter: GlobList,
    pub sandbox_filter: GlobList,

    pub private_environment: IndexMap<String, String>,
    #[serde(rename = "environment")]
    pub self_environment: IndexMap<String, String>,
    pub meta_environment: IndexMap<String, String>,

    pub checkout_vars: IndexSet<String>,
    pub checkout_vars_weak: IndexSet<String>,
    pub build_vars: IndexSet<String>,
    pub build_vars_weak: IndexSet<String>,
    pub package_vars: IndexSet<String>,
    pub package_vars_weak: IndexSet<String>,

    pub checkout_tools: IndexSet<String>,
    pub build_tools: IndexSet<String>,
    pub package_tools: IndexSet<String>,

    pub provides: Provides,

    #[serde(rename = "checkoutScript")]
    pub checkout: Option<String>,
    #[serde(rename = "buildScript")]
    pub build: Option<String>,
    #[serde(rename = "packageScript")]
    pub package: Option<String>,

    #[serde(rename = "checkoutSCM")]
    pub checkout_scm: Vec<ScmEntry>,
    pub checkout_asserts: Vec<String>,
    pub checkout_deterministic: Option<bool>,

    pub root: Option<bool>,
    pub shared: Option<bool>,
    pub relocatable: Option<bool>,
    pub build_net_access: Option<bool>,
    pub package_net_access: Option<bool>,

    pub fingerprint: Vec<FingerprintScript>,

    /// `multiPackage`: only meaningful on the outermost recipe document; synthesises sibling
    /// recipes that inherit the anonymous base class built from the rest of this document.
    #[serde(rename = "multiPackage", deserialize_with = "sequence_of_key_value")]
    pub multi_package: Vec<KeyValue<ClassFragment>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Provides {
    pub environment: IndexMap<String, String>,
    pub tools: IndexMap<String, AbstractTool>,
    pub deps: Vec<String>,
    pub sandbox: Option<SandboxTemplate>,
}

impl ClassFragment {
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(bytes)
    }

    pub fn vars(&self, kind: StepKind) -> &IndexSet<String> {
        match kind {
            StepKind::Checkout => &self.checkout_vars,
            StepKind::Build => &self.build_vars,
            StepKind::Package => &self.package_vars,
        }
    }

    pub fn weak_vars(&self, kind: StepKind) -> &IndexSet<String> {
        match kind {
            StepKind::Checkout => &self.checkout_vars_weak,
            StepKind::Build => &self.build_vars_weak,
            StepKind::Package => &self.package_vars_weak,
        }
    }

    pub fn tools(&self, kind: StepKind) -> &IndexSet<String> {
        match kind {
            StepKind::Checkout => &self.checkout_tools,
            StepKind::Build => &self.build_tools,
            StepKind::Package => &self.package_tools,
        }
    }

    pub fn script(&self, kind: StepKind) -> Option<&str> {
        match kind {
            StepKind::Checkout => self.checkout.as_deref(),
            StepKind::Build => self.build.as_deref(),
            StepKind::Package => self.package.as_deref(),
        }
    }
}
