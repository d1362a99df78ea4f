//! Aggregate functions and their accumulator states
//!
//! An aggregation runs in one of three modes:
//! - `IterFinal`: raw rows in, final values out
//! - `IterPartial`: raw rows in, partial states out (shard side)
//! - `PartialFinal`: partial states in, final values out (handler side)
//!
//! Partial states are plain values so they can travel between nodes as
//! ordinary row cells. `avg` is the only function whose partial state is
//! not its final value: it travels as `[sum, count]`.

use serde::{Deserialize, Serialize};

use crate::data::Value;
use crate::engine::{ExecResult, ExecutionError};
use crate::expression::Symbol;

/// Built-in aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    CountStar,
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Arbitrary,
}

impl AggregateFunction {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::CountStar => "count(*)",
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Arbitrary => "arbitrary",
        }
    }

    /// Number of input symbols the function consumes
    pub fn arity(&self) -> usize {
        match self {
            AggregateFunction::CountStar => 0,
            _ => 1,
        }
    }
}

/// Input/output shape of an aggregation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMode {
    #[default]
    IterFinal,
    IterPartial,
    PartialFinal,
}

impl AggregateMode {
    fn consumes_partials(&self) -> bool {
        matches!(self, AggregateMode::PartialFinal)
    }

    fn produces_partials(&self) -> bool {
        matches!(self, AggregateMode::IterPartial)
    }
}

/// One aggregate call in a projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    #[serde(default)]
    pub inputs: Vec<Symbol>,
}

impl Aggregation {
    pub fn new(function: AggregateFunction, inputs: Vec<Symbol>) -> Self {
        Self { function, inputs }
    }

    pub fn count_star() -> Self {
        Self::new(AggregateFunction::CountStar, Vec::new())
    }

    /// Validates the number of inputs for the given mode.
    ///
    /// In `PartialFinal` every function (count(*) included) reads exactly
    /// one partial-state column.
    pub fn validate(&self, mode: AggregateMode) -> ExecResult<()> {
        let expected = if mode.consumes_partials() {
            1
        } else {
            self.function.arity()
        };
        if self.inputs.len() != expected {
            return Err(ExecutionError::invalid_parameter(format!(
                "{} expects {} input(s) in {:?} mode, got {}",
                self.function.name(),
                expected,
                mode,
                self.inputs.len()
            )));
        }
        Ok(())
    }
}

/// Mutable accumulator for one aggregate call
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateState {
    Count(i64),
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: i64 },
    Arbitrary(Option<Value>),
}

/// Fixed accounting charge for a fresh state
pub const STATE_SIZE: usize = std::mem::size_of::<AggregateState>();

impl AggregateState {
    pub fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::CountStar | AggregateFunction::Count => AggregateState::Count(0),
            AggregateFunction::Sum => AggregateState::Sum(None),
            AggregateFunction::Min => AggregateState::Min(None),
            AggregateFunction::Max => AggregateState::Max(None),
            AggregateFunction::Avg => AggregateState::Avg { sum: 0.0, count: 0 },
            AggregateFunction::Arbitrary => AggregateState::Arbitrary(None),
        }
    }

    /// Feeds one row's value(s). `value` is `None` for count(*).
    pub fn iterate(&mut self, function: AggregateFunction, value: Option<&Value>) -> ExecResult<()> {
        if function == AggregateFunction::CountStar {
            if let AggregateState::Count(n) = self {
                *n += 1;
            }
            return Ok(());
        }
        let value = match value {
            Some(v) if !v.is_null() => v,
            _ => return Ok(()),
        };
        match self {
            AggregateState::Count(n) => *n += 1,
            AggregateState::Sum(acc) => *acc = Some(add(acc.take(), value)?),
            AggregateState::Min(acc) => {
                if acc.as_ref().map_or(true, |cur| value.total_cmp(cur).is_lt()) {
                    *acc = Some(value.clone());
                }
            }
            AggregateState::Max(acc) => {
                if acc.as_ref().map_or(true, |cur| value.total_cmp(cur).is_gt()) {
                    *acc = Some(value.clone());
                }
            }
            AggregateState::Avg { sum, count } => {
                let v = value.as_f64().ok_or_else(|| {
                    ExecutionError::evaluation(format!("avg cannot aggregate {}", value.type_name()))
                })?;
                *sum += v;
                *count += 1;
            }
            AggregateState::Arbitrary(acc) => {
                if acc.is_none() {
                    *acc = Some(value.clone());
                }
            }
        }
        Ok(())
    }

    /// Merges a partial state produced by `terminate_partial` elsewhere
    pub fn reduce(&mut self, function: AggregateFunction, partial: &Value) -> ExecResult<()> {
        if partial.is_null() {
            return Ok(());
        }
        match self {
            AggregateState::Count(n) => {
                *n += partial.as_i64().ok_or_else(|| bad_partial(function, partial))?;
            }
            AggregateState::Avg { sum, count } => match partial {
                Value::Array(parts) if parts.len() == 2 => {
                    *sum += parts[0].as_f64().ok_or_else(|| bad_partial(function, partial))?;
                    *count += parts[1].as_i64().ok_or_else(|| bad_partial(function, partial))?;
                }
                _ => return Err(bad_partial(function, partial)),
            },
            // sum/min/max/arbitrary partials have the same shape as inputs
            _ => self.iterate(function, Some(partial))?,
        }
        Ok(())
    }

    /// Partial state as a transportable value
    pub fn terminate_partial(&self) -> Value {
        match self {
            AggregateState::Avg { sum, count } => {
                Value::Array(vec![Value::Double(*sum), Value::Long(*count)])
            }
            other => other.terminate_final(),
        }
    }

    /// Final aggregate value
    pub fn terminate_final(&self) -> Value {
        match self {
            AggregateState::Count(n) => Value::Long(*n),
            AggregateState::Sum(v)
            | AggregateState::Min(v)
            | AggregateState::Max(v)
            | AggregateState::Arbitrary(v) => v.clone().unwrap_or(Value::Null),
            AggregateState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Double(sum / *count as f64)
                }
            }
        }
    }
}

fn add(acc: Option<Value>, value: &Value) -> ExecResult<Value> {
    let acc = match acc {
        None => {
            return match value {
                Value::Long(_) | Value::Double(_) => Ok(value.clone()),
                other => Err(ExecutionError::evaluation(format!(
                    "sum cannot aggregate {}",
                    other.type_name()
                ))),
            }
        }
        Some(acc) => acc,
    };
    match (&acc, value) {
        (Value::Long(a), Value::Long(b)) => a
            .checked_add(*b)
            .map(Value::Long)
            .ok_or_else(|| ExecutionError::evaluation("long overflow in sum")),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Double(a + b)),
            _ => Err(ExecutionError::evaluation(format!(
                "sum cannot aggregate {}",
                b.type_name()
            ))),
        },
    }
}

fn bad_partial(function: AggregateFunction, partial: &Value) -> ExecutionError {
    ExecutionError::evaluation(format!(
        "invalid partial state for {}: {}",
        function.name(),
        partial
    ))
}

/// Compiled aggregate call: function, mode and evaluator for its input
pub struct AggregationContext {
    function: AggregateFunction,
    mode: AggregateMode,
    input: Option<Box<dyn crate::expression::Input>>,
}

impl AggregationContext {
    pub fn compile(aggregation: &Aggregation, mode: AggregateMode) -> ExecResult<Self> {
        aggregation.validate(mode)?;
        let input = match aggregation.inputs.first() {
            Some(symbol) => Some(crate::expression::InputFactory::compile(symbol)?),
            None => None,
        };
        Ok(Self {
            function: aggregation.function,
            mode,
            input,
        })
    }

    pub fn compile_all(aggregations: &[Aggregation], mode: AggregateMode) -> ExecResult<Vec<Self>> {
        aggregations
            .iter()
            .map(|a| Self::compile(a, mode))
            .collect()
    }

    pub fn new_state(&self) -> AggregateState {
        AggregateState::new(self.function)
    }

    /// Applies one input row to `state`
    pub fn accumulate(&self, state: &mut AggregateState, row: &dyn crate::data::Row) -> ExecResult<()> {
        let value = match &self.input {
            Some(input) => Some(input.value(row)?),
            None => None,
        };
        if self.mode.consumes_partials() {
            state.reduce(self.function, value.as_ref().unwrap_or(&Value::Null))
        } else {
            state.iterate(self.function, value.as_ref())
        }
    }

    pub fn terminate(&self, state: &AggregateState) -> Value {
        if self.mode.produces_partials() {
            state.terminate_partial()
        } else {
            state.terminate_final()
        }
    }
}
