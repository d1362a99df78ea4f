//! Scalar functions
//!
//! Comparisons and boolean operators follow SQL three-valued logic: a
//! NULL operand yields NULL unless the result is already decided
//! (`false AND NULL` is false, `true OR NULL` is true).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::data::Value;
use crate::engine::{ExecResult, ExecutionError};

/// Built-in scalar functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarFunction {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    IsNull,
    Add,
    Subtract,
    Multiply,
    Concat,
}

impl ScalarFunction {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarFunction::Eq => "eq",
            ScalarFunction::NotEq => "not_eq",
            ScalarFunction::Gt => "gt",
            ScalarFunction::Gte => "gte",
            ScalarFunction::Lt => "lt",
            ScalarFunction::Lte => "lte",
            ScalarFunction::And => "and",
            ScalarFunction::Or => "or",
            ScalarFunction::Not => "not",
            ScalarFunction::IsNull => "is_null",
            ScalarFunction::Add => "add",
            ScalarFunction::Subtract => "subtract",
            ScalarFunction::Multiply => "multiply",
            ScalarFunction::Concat => "concat",
        }
    }

    /// Checks the argument count at compile time
    pub fn check_arity(&self, args: usize) -> ExecResult<()> {
        let ok = match self {
            ScalarFunction::Not | ScalarFunction::IsNull => args == 1,
            ScalarFunction::Concat => args >= 1,
            _ => args == 2,
        };
        if ok {
            Ok(())
        } else {
            Err(ExecutionError::invalid_parameter(format!(
                "{} does not accept {} argument(s)",
                self.name(),
                args
            )))
        }
    }

    /// Applies the function to already evaluated arguments
    pub fn apply(&self, args: &[Value]) -> ExecResult<Value> {
        match self {
            ScalarFunction::Eq => Ok(compare(args, |o| o == Ordering::Equal)),
            ScalarFunction::NotEq => Ok(compare(args, |o| o != Ordering::Equal)),
            ScalarFunction::Gt => Ok(compare(args, |o| o == Ordering::Greater)),
            ScalarFunction::Gte => Ok(compare(args, |o| o != Ordering::Less)),
            ScalarFunction::Lt => Ok(compare(args, |o| o == Ordering::Less)),
            ScalarFunction::Lte => Ok(compare(args, |o| o != Ordering::Greater)),
            ScalarFunction::And => logical(self, args, false),
            ScalarFunction::Or => logical(self, args, true),
            ScalarFunction::Not => match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(type_error(self, other)),
            },
            ScalarFunction::IsNull => Ok(Value::Bool(args[0].is_null())),
            ScalarFunction::Add => arithmetic(self, &args[0], &args[1], i64::checked_add, |a, b| a + b),
            ScalarFunction::Subtract => {
                arithmetic(self, &args[0], &args[1], i64::checked_sub, |a, b| a - b)
            }
            ScalarFunction::Multiply => {
                arithmetic(self, &args[0], &args[1], i64::checked_mul, |a, b| a * b)
            }
            ScalarFunction::Concat => {
                if args.iter().all(Value::is_null) {
                    return Ok(Value::Null);
                }
                let mut out = String::new();
                for arg in args.iter().filter(|a| !a.is_null()) {
                    out.push_str(&arg.to_string());
                }
                Ok(Value::Text(out))
            }
        }
    }
}

fn compare(args: &[Value], test: impl Fn(Ordering) -> bool) -> Value {
    if args[0].is_null() || args[1].is_null() {
        return Value::Null;
    }
    Value::Bool(test(args[0].total_cmp(&args[1])))
}

/// `decisive` is the operand value that settles the result on its own:
/// false for AND, true for OR.
fn logical(function: &ScalarFunction, args: &[Value], decisive: bool) -> ExecResult<Value> {
    let mut saw_null = false;
    for arg in args {
        match arg {
            Value::Bool(b) if *b == decisive => return Ok(Value::Bool(decisive)),
            Value::Bool(_) => {}
            Value::Null => saw_null = true,
            other => return Err(type_error(function, other)),
        }
    }
    if saw_null {
        Ok(Value::Null)
    } else {
        Ok(Value::Bool(!decisive))
    }
}

fn arithmetic(
    function: &ScalarFunction,
    a: &Value,
    b: &Value,
    long_op: fn(i64, i64) -> Option<i64>,
    double_op: fn(f64, f64) -> f64,
) -> ExecResult<Value> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Long(x), Value::Long(y)) => long_op(*x, *y).map(Value::Long).ok_or_else(|| {
            ExecutionError::evaluation(format!("long overflow in {}({}, {})", function.name(), x, y))
        }),
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::Double(double_op(x, y))),
            (None, _) => Err(type_error(function, a)),
            (_, None) => Err(type_error(function, b)),
        },
    }
}

fn type_error(function: &ScalarFunction, value: &Value) -> ExecutionError {
    ExecutionError::evaluation(format!(
        "{} cannot be applied to a {} argument",
        function.name(),
        value.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_with_null_is_null() {
        assert_eq!(
            ScalarFunction::Gt.apply(&[Value::Null, Value::Long(1)]).unwrap(),
            Value::Null
        );
        assert_eq!(
            ScalarFunction::Gte.apply(&[Value::Long(1), Value::Double(1.0)]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_three_valued_and_or() {
        let f = Value::Bool(false);
        let t = Value::Bool(true);
        assert_eq!(ScalarFunction::And.apply(&[f.clone(), Value::Null]).unwrap(), f);
        assert_eq!(ScalarFunction::And.apply(&[t.clone(), Value::Null]).unwrap(), Value::Null);
        assert_eq!(ScalarFunction::Or.apply(&[Value::Null, t.clone()]).unwrap(), t);
        assert_eq!(ScalarFunction::Or.apply(&[f.clone(), f.clone()]).unwrap(), f);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            ScalarFunction::Add.apply(&[Value::Long(2), Value::Long(3)]).unwrap(),
            Value::Long(5)
        );
        assert_eq!(
            ScalarFunction::Multiply.apply(&[Value::Long(2), Value::Double(1.5)]).unwrap(),
            Value::Double(3.0)
        );
        assert!(ScalarFunction::Add
            .apply(&[Value::Long(i64::MAX), Value::Long(1)])
            .is_err());
        assert!(ScalarFunction::Subtract
            .apply(&[Value::Text("a".into()), Value::Long(1)])
            .is_err());
    }

    #[test]
    fn test_concat_skips_nulls() {
        let out = ScalarFunction::Concat
            .apply(&[Value::Text("a".into()), Value::Null, Value::Long(1)])
            .unwrap();
        assert_eq!(out, Value::Text("a1".into()));
    }

    #[test]
    fn test_arity() {
        assert!(ScalarFunction::Not.check_arity(1).is_ok());
        assert!(ScalarFunction::Eq.check_arity(3).is_err());
        assert!(ScalarFunction::Concat.check_arity(0).is_err());
    }
}
