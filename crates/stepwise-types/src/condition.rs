//! Declarative step conditions.
//!
//! A `when` clause written as JSON is parsed into a tagged [`Condition`] tree
//! whose leaves compare a referenced value against a [`Query`]:
//!
//! ```json
//! {
//!   "fetch.status": "success",
//!   "and": [{ "fetch.count": { "$gt": 0 } }],
//!   "or":  [{ "ref": { "step": "trigger", "path": "mode" }, "query": { "$in": ["fast", "full"] } }],
//!   "not": { "fetch.count": { "$eq": 13 } }
//! }
//! ```
//!
//! Evaluation lives in `stepwise-core`; this module only owns the shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const KEY_REF: &str = "ref";
const KEY_QUERY: &str = "query";
const KEY_AND: &str = "and";
const KEY_OR: &str = "or";
const KEY_NOT: &str = "not";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing a declarative condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionParseError {
    #[error("condition must be a JSON object, got {0}")]
    NotAnObject(Value),

    #[error("'ref' must be an object with a string 'step' and optional string 'path'")]
    InvalidRef,

    #[error("'{0}' must be an array of conditions")]
    NotAnArray(&'static str),

    #[error("'query' is only valid together with 'ref'")]
    QueryWithoutRef,

    #[error("'ref' requires a 'query'")]
    RefWithoutQuery,

    #[error("unknown query operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{operator}' expects {expected}")]
    InvalidOperand {
        operator: String,
        expected: &'static str,
    },

    #[error("query object mixes operators and field names")]
    MixedQuery,
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Boolean condition tree.
///
/// `And(vec![])` is vacuously true; it is what an object with no recognised
/// keys parses to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Condition {
    /// Look up `path` in `step`'s output (or the trigger) and match `query`.
    Ref {
        step: String,
        path: String,
        query: Query,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn reference(step: impl Into<String>, path: impl Into<String>, query: Query) -> Self {
        Condition::Ref {
            step: step.into(),
            path: path.into(),
            query,
        }
    }

    /// Shorthand for the `"<step>.<path>"` form.
    pub fn dotted(key: &str, query: Query) -> Self {
        let (step, path) = split_dotted(key);
        Condition::reference(step, path, query)
    }

    pub fn always() -> Self {
        Condition::And(Vec::new())
    }

    /// Parse a JSON condition object.
    pub fn from_value(value: &Value) -> Result<Self, ConditionParseError> {
        let object = value
            .as_object()
            .ok_or_else(|| ConditionParseError::NotAnObject(value.clone()))?;

        let mut parts = Vec::new();

        match (object.get(KEY_REF), object.get(KEY_QUERY)) {
            (Some(reference), Some(query)) => {
                let reference = reference.as_object().ok_or(ConditionParseError::InvalidRef)?;
                let step = reference
                    .get("step")
                    .and_then(Value::as_str)
                    .ok_or(ConditionParseError::InvalidRef)?;
                let path = match reference.get("path") {
                    None => "",
                    Some(Value::String(path)) => path.as_str(),
                    Some(_) => return Err(ConditionParseError::InvalidRef),
                };
                parts.push(Condition::reference(step, path, Query::from_value(query)?));
            }
            (Some(_), None) => return Err(ConditionParseError::RefWithoutQuery),
            (None, Some(_)) => return Err(ConditionParseError::QueryWithoutRef),
            (None, None) => {}
        }

        for (key, query) in object {
            if matches!(
                key.as_str(),
                KEY_REF | KEY_QUERY | KEY_AND | KEY_OR | KEY_NOT
            ) {
                continue;
            }
            parts.push(Condition::dotted(key, Query::from_value(query)?));
        }

        if let Some(and) = object.get(KEY_AND) {
            parts.push(Condition::And(parse_list(and, KEY_AND)?));
        }

        if let Some(or) = object.get(KEY_OR) {
            let branches = parse_list(or, KEY_OR)?;
            // An empty `or` list does not constrain the result.
            if !branches.is_empty() {
                parts.push(Condition::Or(branches));
            }
        }

        if let Some(not) = object.get(KEY_NOT) {
            parts.push(Condition::Not(Box::new(Condition::from_value(not)?)));
        }

        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(Condition::And(parts))
        }
    }

    /// Render back into the JSON object form.
    pub fn to_value(&self) -> Value {
        match self {
            Condition::Ref { step, path, query } => {
                let mut reference = Map::new();
                reference.insert("step".into(), Value::String(step.clone()));
                reference.insert("path".into(), Value::String(path.clone()));
                let mut object = Map::new();
                object.insert(KEY_REF.into(), Value::Object(reference));
                object.insert(KEY_QUERY.into(), query.to_value());
                Value::Object(object)
            }
            Condition::And(items) => {
                let mut object = Map::new();
                object.insert(
                    KEY_AND.into(),
                    Value::Array(items.iter().map(Condition::to_value).collect()),
                );
                Value::Object(object)
            }
            Condition::Or(items) => {
                let mut object = Map::new();
                object.insert(
                    KEY_OR.into(),
                    Value::Array(items.iter().map(Condition::to_value).collect()),
                );
                Value::Object(object)
            }
            Condition::Not(inner) => {
                let mut object = Map::new();
                object.insert(KEY_NOT.into(), inner.to_value());
                Value::Object(object)
            }
        }
    }
}

impl TryFrom<Value> for Condition {
    type Error = ConditionParseError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Condition::from_value(&value)
    }
}

impl From<Condition> for Value {
    fn from(condition: Condition) -> Self {
        condition.to_value()
    }
}

fn parse_list(value: &Value, key: &'static str) -> Result<Vec<Condition>, ConditionParseError> {
    value
        .as_array()
        .ok_or(ConditionParseError::NotAnArray(key))?
        .iter()
        .map(Condition::from_value)
        .collect()
}

/// Split `"fetch.items.0"` into `("fetch", "items.0")`.
fn split_dotted(key: &str) -> (&str, &str) {
    match key.split_once('.') {
        Some((step, path)) => (step, path),
        None => (key, ""),
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Matcher applied to a single looked-up value.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    /// Nested object matching: every field must satisfy its query.
    Fields(BTreeMap<String, Query>),
    /// Several operators on the same value, e.g. `{ "$gt": 0, "$lt": 10 }`.
    All(Vec<Query>),
}

impl Query {
    pub fn from_value(value: &Value) -> Result<Self, ConditionParseError> {
        let Some(object) = value.as_object() else {
            return Ok(Query::Eq(value.clone()));
        };
        if object.is_empty() {
            return Ok(Query::Eq(value.clone()));
        }

        let operator_count = object.keys().filter(|k| k.starts_with('$')).count();
        if operator_count == 0 {
            let fields = object
                .iter()
                .map(|(field, query)| Ok((field.clone(), Query::from_value(query)?)))
                .collect::<Result<BTreeMap<_, _>, ConditionParseError>>()?;
            return Ok(Query::Fields(fields));
        }
        if operator_count != object.len() {
            return Err(ConditionParseError::MixedQuery);
        }

        let mut queries = object
            .iter()
            .map(|(operator, operand)| parse_operator(operator, operand))
            .collect::<Result<Vec<_>, _>>()?;

        if queries.len() == 1 {
            Ok(queries.remove(0))
        } else {
            Ok(Query::All(queries))
        }
    }

    pub fn to_value(&self) -> Value {
        let single = |op: &str, operand: Value| {
            let mut object = Map::new();
            object.insert(op.to_string(), operand);
            Value::Object(object)
        };
        match self {
            Query::Eq(v) => single("$eq", v.clone()),
            Query::Ne(v) => single("$ne", v.clone()),
            Query::Gt(v) => single("$gt", v.clone()),
            Query::Gte(v) => single("$gte", v.clone()),
            Query::Lt(v) => single("$lt", v.clone()),
            Query::Lte(v) => single("$lte", v.clone()),
            Query::In(vs) => single("$in", Value::Array(vs.clone())),
            Query::Nin(vs) => single("$nin", Value::Array(vs.clone())),
            Query::Exists(b) => single("$exists", Value::Bool(*b)),
            Query::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(field, query)| (field.clone(), query.to_value()))
                    .collect(),
            ),
            Query::All(queries) => {
                let mut object = Map::new();
                for query in queries {
                    if let Value::Object(part) = query.to_value() {
                        object.extend(part);
                    }
                }
                Value::Object(object)
            }
        }
    }
}

fn parse_operator(operator: &str, operand: &Value) -> Result<Query, ConditionParseError> {
    let list = |operand: &Value| {
        operand
            .as_array()
            .cloned()
            .ok_or_else(|| ConditionParseError::InvalidOperand {
                operator: operator.to_string(),
                expected: "an array",
            })
    };

    let query = match operator {
        "$eq" => Query::Eq(operand.clone()),
        "$ne" => Query::Ne(operand.clone()),
        "$gt" => Query::Gt(operand.clone()),
        "$gte" => Query::Gte(operand.clone()),
        "$lt" => Query::Lt(operand.clone()),
        "$lte" => Query::Lte(operand.clone()),
        "$in" => Query::In(list(operand)?),
        "$nin" => Query::Nin(list(operand)?),
        "$exists" => Query::Exists(operand.as_bool().ok_or_else(|| {
            ConditionParseError::InvalidOperand {
                operator: operator.to_string(),
                expected: "a boolean",
            }
        })?),
        other => return Err(ConditionParseError::UnknownOperator(other.to_string())),
    };
    Ok(query)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
