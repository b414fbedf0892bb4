//! Argument expressions of the promise algebra.
//!
//! Arguments are lazy leaves: they produce a string only when evaluated
//! against the current call frame (the positional arguments of the
//! enclosing named promise) and the context's variable map. Evaluation is
//! pure - no side effects, no IO beyond a process-environment read.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Variable bindings of one evaluation scope.
pub type Variables = HashMap<String, String>;

/// Value returned by a variable reference whose name is unbound.
///
/// This is observable behaviour: promise sources use it to drive
/// conditional commands, so an unbound lookup must not fail.
pub const MISSING: &str = "missing";

/// A lazy argument expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Argument {
    /// A literal string.
    Constant(String),
    /// The positional argument at the given index of the current frame.
    /// Out-of-range references yield the empty string.
    ArgRef(usize),
    /// A variable bound in the current context, or [`MISSING`] when unbound.
    VarRef(String),
    /// A process-environment lookup; unset names yield the empty string.
    EnvRef(String),
    /// Concatenation of the sub-arguments' values.
    Join(Vec<Argument>),
}

impl Argument {
    /// Evaluate this argument against a call frame and variable map.
    #[must_use]
    pub fn value(&self, frame: &[String], vars: &Variables) -> String {
        match self {
            Self::Constant(s) => s.clone(),
            Self::ArgRef(pos) => frame.get(*pos).cloned().unwrap_or_default(),
            Self::VarRef(name) => vars
                .get(name)
                .cloned()
                .unwrap_or_else(|| MISSING.to_string()),
            Self::EnvRef(name) => std::env::var(name).unwrap_or_default(),
            Self::Join(parts) => parts.iter().map(|a| a.value(frame, vars)).collect(),
        }
    }

    /// Constant constructor convenience used throughout the parser and
    /// tests.
    pub fn constant(s: impl Into<String>) -> Self {
        Self::Constant(s.into())
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(s) => write!(f, "{s}"),
            Self::ArgRef(pos) => write!(f, "arg->{pos}"),
            Self::VarRef(name) => write!(f, "[var:{name}]"),
            Self::EnvRef(name) => write!(f, "[env:{name}]"),
            Self::Join(parts) => {
                let rendered: Vec<String> = parts.iter().map(ToString::to_string).collect();
                write!(f, "joinargs-> {}", rendered.join(" + "))
            },
        }
    }
}
