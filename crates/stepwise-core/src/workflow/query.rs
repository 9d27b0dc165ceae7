//! Generic matcher for the declarative query AST.
//!
//! A [`Query`] is applied to a single looked-up value. `None` stands for a
//! value that is absent (missing key); it only satisfies `$exists: false`,
//! `$ne`/`$nin` and equality against `null`.

use std::cmp::Ordering;

use serde_json::Value;
use stepwise_types::condition::Query;

/// Whether `value` satisfies `query`.
pub fn matches(query: &Query, value: Option<&Value>) -> bool {
    match query {
        Query::Eq(expected) => equals(value, expected),
        Query::Ne(expected) => !equals(value, expected),
        Query::Gt(operand) => compare(value, operand) == Some(Ordering::Greater),
        Query::Gte(operand) => matches!(
            compare(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Query::Lt(operand) => compare(value, operand) == Some(Ordering::Less),
        Query::Lte(operand) => matches!(
            compare(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Query::In(candidates) => candidates.iter().any(|c| equals(value, c)),
        Query::Nin(candidates) => !candidates.iter().any(|c| equals(value, c)),
        Query::Exists(expected) => value.is_some() == *expected,
        Query::Fields(fields) => match value {
            Some(Value::Object(object)) => fields
                .iter()
                .all(|(field, query)| matches(query, object.get(field))),
            _ => false,
        },
        Query::All(queries) => queries.iter().all(|q| matches(q, value)),
    }
}

/// Equality with array-contains: `[1, 2]` equals `2`.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(actual) => {
            if json_eq(actual, expected) {
                return true;
            }
            match actual {
                Value::Array(items) if !expected.is_array() => {
                    items.iter().any(|item| json_eq(item, expected))
                }
                _ => false,
            }
        }
    }
}

/// Deep equality that treats `1` and `1.0` as the same number.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}

/// Ordering between comparable scalars; `None` when types differ.
fn compare(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (value?, operand) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
