// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Elaboration errors, carrying a frame stack (recipe → dependency → field) attached as the error
//! unwinds through nested `prepare` calls, the way `boulder::recipe::Error` wraps lower-level
//! errors instead of discarding their context.

use std::fmt;

use thiserror::Error;

/// One level of context attached while an [`Error`] unwinds through `prepare`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub recipe: String,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("recipe '{name}' not found")]
    UnknownRecipe { name: String },
    #[error("cyclic dependency on '{recipe}'")]
    Cycle { recipe: String },
    #[error("dependency '{dep}' of '{caller}' is named more than once with incompatible variant ids")]
    IncompatibleDependency { caller: String, dep: String },
    #[error("recipe '{recipe}' provides the dependency '{name}' with two incompatible variant ids")]
    IncompatibleProvidedDep { recipe: String, name: String },
    #[error("recipe '{recipe}': two tools define the environment variable '{name}'")]
    DuplicateToolEnv { recipe: String, name: String },
    #[error("recipe '{recipe}': provideDeps pattern '{pattern}' matched no dependency")]
    UnknownProvideDepsPattern { recipe: String, pattern: String },
    #[error("package '{name}' is marked shared but is not deterministic")]
    NonDeterministicShared { name: String },
    #[error("evaluating '{expr}' in recipe '{recipe}'")]
    Condition {
        recipe: String,
        expr: String,
        #[source]
        source: anvil_env::EnvError,
    },
    #[error(transparent)]
    Env(#[from] anvil_env::EnvError),
}

/// An [`ErrorKind`] plus the stack of recipe frames it unwound through, innermost first.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub frames: Vec<Frame>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, frames: Vec::new() }
    }

    /// Attach one more frame of context, innermost call first. Returns `self` so call-sites can
    /// chain this onto `.map_err(...)`.
    pub fn with_frame(mut self, recipe: impl Into<String>, detail: impl Into<String>) -> Self {
        self.frames.push(Frame {
            recipe: recipe.into(),
            detail: detail.into(),
        });
        self
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<anvil_env::EnvError> for Error {
    fn from(source: anvil_env::EnvError) -> Self {
        Error::new(ErrorKind::Env(source))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.frames {
            write!(f, "\n  while elaborating '{}' ({})", frame.recipe, frame.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
