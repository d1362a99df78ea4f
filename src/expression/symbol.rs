//! Logical expression trees
//!
//! Symbols arrive pre-analyzed from the planner: column references are
//! already positional (`Input { index }`) against the row the stage
//! receives.

use serde::{Deserialize, Serialize};

use super::scalar::ScalarFunction;
use crate::data::Value;

/// Logical expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Symbol {
    /// Column of the incoming row
    Input { index: usize },
    /// Constant
    Literal { value: Value },
    /// Scalar function application
    Function {
        name: ScalarFunction,
        args: Vec<Symbol>,
    },
}

impl Symbol {
    pub fn input(index: usize) -> Self {
        Symbol::Input { index }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Symbol::Literal {
            value: value.into(),
        }
    }

    pub fn function(name: ScalarFunction, args: Vec<Symbol>) -> Self {
        Symbol::Function { name, args }
    }
}
