// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! A touch-tracked, insertion-ordered `name -> CoreRef` map, the tool-table analogue of
//! [`anvil_env::Env`]. `PackageMatcher` needs to know exactly which tool names a `prepare()` call
//! actually consulted, the same way it needs the touched env names, so the accumulated "own
//! tools" and per-dependency "dep tools" views both share this shape.

use std::{cell::RefCell, rc::Rc};

use globset::{Glob, GlobSetBuilder};
use indexmap::{IndexMap, IndexSet};

use crate::core_ref::CoreRef;

#[derive(Clone, Default)]
pub struct ToolSet {
    tools: IndexMap<String, CoreRef>,
    touched: Rc<RefCell<IndexSet<String>>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child view sharing this one's touched-name family.
    pub fn derive(&self) -> Self {
        Self {
            tools: self.tools.clone(),
            touched: Rc::clone(&self.touched),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, tool: CoreRef) {
        self.tools.insert(name.into(), tool);
    }

    /// Merge `other`'s tools into `self`, child (`other`) taking precedence on name collision.
    pub fn update(&mut self, other: &ToolSet) {
        for (name, tool) in &other.tools {
            self.tools.insert(name.clone(), tool.clone());
        }
    }

    /// Read without recording a touch.
    pub fn peek(&self, name: &str) -> Option<&CoreRef> {
        self.tools.get(name)
    }

    /// Read, recording the read.
    pub fn get(&self, name: &str) -> Option<&CoreRef> {
        self.touch(name);
        self.tools.get(name)
    }

    pub fn touch(&self, name: &str) {
        self.touched.borrow_mut().insert(name.to_string());
    }

    pub fn touched_keys(&self) -> Vec<String> {
        self.touched.borrow().iter().cloned().collect()
    }

    pub fn touch_reset(&mut self) {
        self.touched = Rc::new(RefCell::new(IndexSet::new()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CoreRef)> {
        self.tools.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Keep only entries whose name is in `names`.
    pub fn retain_named(&self, names: &IndexSet<String>) -> ToolSet {
        ToolSet {
            tools: self.tools.iter().filter(|(k, _)| names.contains(k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect(),
            touched: Rc::clone(&self.touched),
        }
    }

    /// Keep only entries whose name matches one of `patterns` (glob syntax).
    pub fn filter(&self, patterns: &[String]) -> Result<ToolSet, globset::Error> {
        let set = build_globset(patterns)?;
        Ok(ToolSet {
            tools: self.tools.iter().filter(|(k, _)| set.is_match(k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect(),
            touched: Rc::clone(&self.touched),
        })
    }

    /// Drop every entry whose name matches one of `patterns`.
    pub fn prune(&self, patterns: &[String]) -> Result<ToolSet, globset::Error> {
        let set = build_globset(patterns)?;
        Ok(ToolSet {
            tools: self.tools.iter().filter(|(k, _)| !set.is_match(k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect(),
            touched: Rc::clone(&self.touched),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<globset::GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core_ref::CoreTarget;
    use anvil_digest::Digest;

    fn dummy_ref() -> CoreRef {
        CoreRef::leaf(CoreTarget::None, Digest::Short([0; 20]), true, true, String::new())
    }

    #[test]
    fn derive_shares_touched_family() {
        let root = ToolSet::new();
        let child = root.derive();
        child.touch("gcc");
        assert_eq!(root.touched_keys(), vec!["gcc".to_string()]);
    }

    #[test]
    fn get_records_touch() {
        let mut ts = ToolSet::new();
        ts.set("gcc", dummy_ref());
        assert!(ts.get("gcc").is_some());
        assert_eq!(ts.touched_keys(), vec!["gcc".to_string()]);
    }
}
