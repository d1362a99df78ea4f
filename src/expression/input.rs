//! Expression evaluation bridge
//!
//! `InputFactory` compiles a symbol tree once into a tree of `Input`
//! evaluators; stages then call `value(row)` per row. `InputRow` is the
//! collector used by projecting stages: it evaluates a list of inputs into
//! a reused buffer and exposes the result as a shared row.

use super::symbol::Symbol;
use super::scalar::ScalarFunction;
use crate::data::{Row, SharedRow, Value};
use crate::engine::{ExecResult, ExecutionError};

/// Runtime evaluator producing one value per row
pub trait Input: Send + Sync {
    fn value(&self, row: &dyn Row) -> ExecResult<Value>;
}

struct InputColumn {
    index: usize,
}

impl Input for InputColumn {
    fn value(&self, row: &dyn Row) -> ExecResult<Value> {
        if self.index >= row.num_columns() {
            return Err(ExecutionError::evaluation(format!(
                "input column {} out of range for row of width {}",
                self.index,
                row.num_columns()
            )));
        }
        Ok(row.get(self.index).clone())
    }
}

struct LiteralInput {
    value: Value,
}

impl Input for LiteralInput {
    fn value(&self, _row: &dyn Row) -> ExecResult<Value> {
        Ok(self.value.clone())
    }
}

struct FunctionInput {
    function: ScalarFunction,
    args: Vec<Box<dyn Input>>,
}

impl Input for FunctionInput {
    fn value(&self, row: &dyn Row) -> ExecResult<Value> {
        let args = self
            .args
            .iter()
            .map(|arg| arg.value(row))
            .collect::<ExecResult<Vec<_>>>()?;
        self.function.apply(&args)
    }
}

/// Compiles symbols into evaluators
pub struct InputFactory;

impl InputFactory {
    /// Compiles one symbol. Function arity is validated here, so evaluation
    /// never sees a malformed call.
    pub fn compile(symbol: &Symbol) -> ExecResult<Box<dyn Input>> {
        match symbol {
            Symbol::Input { index } => Ok(Box::new(InputColumn { index: *index })),
            Symbol::Literal { value } => Ok(Box::new(LiteralInput {
                value: value.clone(),
            })),
            Symbol::Function { name, args } => {
                name.check_arity(args.len())?;
                Ok(Box::new(FunctionInput {
                    function: *name,
                    args: Self::compile_all(args)?,
                }))
            }
        }
    }

    pub fn compile_all(symbols: &[Symbol]) -> ExecResult<Vec<Box<dyn Input>>> {
        symbols.iter().map(Self::compile).collect()
    }
}

/// Evaluates a fixed list of inputs into a reused row buffer
pub struct InputRow {
    inputs: Vec<Box<dyn Input>>,
    buffer: SharedRow,
}

impl InputRow {
    pub fn new(inputs: Vec<Box<dyn Input>>) -> Self {
        let width = inputs.len();
        Self {
            inputs,
            buffer: SharedRow::with_width(width),
        }
    }

    pub fn compile(symbols: &[Symbol]) -> ExecResult<Self> {
        Ok(Self::new(InputFactory::compile_all(symbols)?))
    }

    /// Number of output columns
    pub fn width(&self) -> usize {
        self.inputs.len()
    }

    /// Evaluates all inputs against `row`.
    ///
    /// The returned view is overwritten by the next call.
    pub fn evaluate(&mut self, row: &dyn Row) -> ExecResult<&SharedRow> {
        let cells = self.buffer.cells_mut();
        cells.clear();
        for input in &self.inputs {
            cells.push(input.value(row)?);
        }
        Ok(&self.buffer)
    }

    /// Evaluates all inputs into a fresh owned vector
    pub fn evaluate_owned(&self, row: &dyn Row) -> ExecResult<Vec<Value>> {
        self.inputs.iter().map(|i| i.value(row)).collect()
    }
}
