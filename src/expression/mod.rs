//! Expression / input evaluation bridge
//!
//! Turns logical symbol trees into evaluators that produce one typed
//! value per row.

mod input;
mod scalar;
mod symbol;

pub use input::{Input, InputFactory, InputRow};
pub use scalar::ScalarFunction;
pub use symbol::Symbol;
