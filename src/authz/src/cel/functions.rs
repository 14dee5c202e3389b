//! Builtin condition functions
//!
//! Numeric functions accept numbers or lists of numbers, so both
//! `Max(1, 2, 3)` and `Max([1, 2, 3])` work.

use serde_json::Value;

use crate::error::{AuthzError, Result};

/// Names of every builtin function
pub const BUILTIN_FUNCTIONS: [&str; 6] = ["Sqrt", "Max", "Min", "Sum", "Avg", "IsSubSet"];

/// Square root of a single number
///
/// # Example
/// ```cel
/// Sqrt(request_amount) < 10.0
/// ```
pub fn sqrt(args: &[Value]) -> Result<Value> {
    let usage = || AuthzError::BuiltinFunction("Usage: Sqrt(x)".to_string());
    match args {
        [x] => {
            let x = x.as_f64().ok_or_else(usage)?;
            Ok(number(x.sqrt()))
        }
        _ => Err(usage()),
    }
}

/// Largest of the arguments
pub fn max(args: &[Value]) -> Result<Value> {
    let values = numbers(args, "Usage: Max(x1, x2, ...), xi must be numeric")?;
    fold_non_empty(&values, "Usage: Max(x1, x2, ...), xi must be numeric", f64::max)
}

/// Smallest of the arguments
pub fn min(args: &[Value]) -> Result<Value> {
    let values = numbers(args, "Usage: Min(x1, x2, ...), xi must be numeric")?;
    fold_non_empty(&values, "Usage: Min(x1, x2, ...), xi must be numeric", f64::min)
}

/// Sum of the arguments; 0 for no arguments
pub fn sum(args: &[Value]) -> Result<Value> {
    let values = numbers(args, "Usage: Sum(x1, x2, ...), xi must be numeric")?;
    Ok(number(values.iter().sum()))
}

/// Mean of the arguments; 0 for no arguments
pub fn avg(args: &[Value]) -> Result<Value> {
    let values = numbers(args, "Usage: Avg(x1, x2, ...), xi must be numeric")?;
    if values.is_empty() {
        return Ok(number(0.0));
    }
    Ok(number(values.iter().sum::<f64>() / values.len() as f64))
}

/// True if every element of the first list is in the second list
///
/// Either list being empty, or the first being longer, yields `false`.
///
/// # Example
/// ```cel
/// IsSubSet(request_groups, ["admins", "operators"])
/// ```
pub fn is_subset(args: &[Value]) -> Result<Value> {
    let usage = || {
        AuthzError::BuiltinFunction(
            "Usage: IsSubSet(S1, S2) - S1 and S2 are both lists, tests if S1 is a subset of S2"
                .to_string(),
        )
    };
    let (subset, superset) = match args {
        [Value::Array(a), Value::Array(b)] => (a, b),
        _ => return Err(usage()),
    };

    if subset.is_empty() || superset.is_empty() || subset.len() > superset.len() {
        return Ok(Value::Bool(false));
    }
    Ok(Value::Bool(subset.iter().all(|item| superset.contains(item))))
}

fn numbers(args: &[Value], usage: &str) -> Result<Vec<f64>> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Array(items) => {
                for item in items {
                    values.push(
                        item.as_f64()
                            .ok_or_else(|| AuthzError::BuiltinFunction(usage.to_string()))?,
                    );
                }
            }
            other => values.push(
                other
                    .as_f64()
                    .ok_or_else(|| AuthzError::BuiltinFunction(usage.to_string()))?,
            ),
        }
    }
    Ok(values)
}

fn fold_non_empty(values: &[f64], usage: &str, f: fn(f64, f64) -> f64) -> Result<Value> {
    let (first, rest) = values
        .split_first()
        .ok_or_else(|| AuthzError::BuiltinFunction(usage.to_string()))?;
    Ok(number(rest.iter().copied().fold(*first, f)))
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
