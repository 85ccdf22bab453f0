//! Typed predicate sets evaluated against a flat lead record.
//!
//! Predicates are stored as `{field, operator, value}` triples. Parsing happens once
//! when a rule is loaded: an operator the engine does not know, or a numeric operator
//! configured with a non-numeric threshold, becomes [`Operator::Unsupported`] and never
//! matches. A misconfigured rule therefore goes inert instead of failing the routing
//! pass for every other rule.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::domain::LeadRecord;

/// Conjunction of field predicates. An empty set matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSet(pub Vec<Predicate>);

impl ConditionSet {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self(predicates)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, record: &LeadRecord) -> bool {
        self.0.iter().all(|predicate| predicate.matches(record))
    }

    /// Predicates that can never match because their configuration is malformed.
    pub fn unsupported(&self) -> impl Iterator<Item = &Predicate> {
        self.0
            .iter()
            .filter(|predicate| matches!(predicate.operator, Operator::Unsupported { .. }))
    }
}

/// Free-function form of [`ConditionSet::matches`].
pub fn matches(conditions: &ConditionSet, record: &LeadRecord) -> bool {
    conditions.matches(record)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPredicate", into = "RawPredicate")]
pub struct Predicate {
    pub field: String,
    pub operator: Operator,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq(Value),
    Neq(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    Contains(Value),
    Unsupported { operator: String, value: Value },
}

impl Predicate {
    pub fn new(field: impl Into<String>, operator: Operator) -> Self {
        Self {
            field: field.into(),
            operator,
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq(value.into()))
    }

    pub fn matches(&self, record: &LeadRecord) -> bool {
        let Some(actual) = record.get(&self.field) else {
            return false;
        };

        match &self.operator {
            Operator::Eq(expected) => values_equal(actual, expected),
            Operator::Neq(expected) => !values_equal(actual, expected),
            Operator::In(candidates) => intersects(actual, candidates),
            Operator::NotIn(candidates) => !intersects(actual, candidates),
            Operator::Gt(threshold) => compare(actual, |value| value > *threshold),
            Operator::Gte(threshold) => compare(actual, |value| value >= *threshold),
            Operator::Lt(threshold) => compare(actual, |value| value < *threshold),
            Operator::Lte(threshold) => compare(actual, |value| value <= *threshold),
            Operator::Contains(expected) => as_set(actual)
                .iter()
                .any(|item| values_equal(item, expected)),
            Operator::Unsupported { .. } => false,
        }
    }
}

/// A list is treated as a set; anything else as a singleton.
fn as_set(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn intersects(actual: &Value, candidates: &[Value]) -> bool {
    as_set(actual).iter().any(|item| {
        candidates
            .iter()
            .any(|candidate| values_equal(item, candidate))
    })
}

fn compare(actual: &Value, predicate: impl Fn(f64) -> bool) -> bool {
    actual.as_f64().map(predicate).unwrap_or(false)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(left), Some(right)) => left == right,
        _ => left == right,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPredicate {
    field: String,
    operator: String,
    #[serde(default)]
    value: Value,
}

impl From<RawPredicate> for Predicate {
    fn from(raw: RawPredicate) -> Self {
        let RawPredicate {
            field,
            operator,
            value,
        } = raw;

        let threshold = value.as_f64();
        let parsed = match (operator.as_str(), threshold) {
            ("eq", _) => Operator::Eq(value),
            ("neq", _) => Operator::Neq(value),
            ("in", _) => Operator::In(into_list(value)),
            ("not_in", _) => Operator::NotIn(into_list(value)),
            ("contains", _) => Operator::Contains(value),
            ("gt", Some(threshold)) => Operator::Gt(threshold),
            ("gte", Some(threshold)) => Operator::Gte(threshold),
            ("lt", Some(threshold)) => Operator::Lt(threshold),
            ("lte", Some(threshold)) => Operator::Lte(threshold),
            _ => Operator::Unsupported { operator, value },
        };

        Predicate {
            field,
            operator: parsed,
        }
    }
}

impl From<Predicate> for RawPredicate {
    fn from(predicate: Predicate) -> Self {
        let (operator, value) = match predicate.operator {
            Operator::Eq(value) => ("eq".to_string(), value),
            Operator::Neq(value) => ("neq".to_string(), value),
            Operator::In(values) => ("in".to_string(), Value::Array(values)),
            Operator::NotIn(values) => ("not_in".to_string(), Value::Array(values)),
            Operator::Gt(threshold) => ("gt".to_string(), Value::from(threshold)),
            Operator::Gte(threshold) => ("gte".to_string(), Value::from(threshold)),
            Operator::Lt(threshold) => ("lt".to_string(), Value::from(threshold)),
            Operator::Lte(threshold) => ("lte".to_string(), Value::from(threshold)),
            Operator::Contains(value) => ("contains".to_string(), value),
            Operator::Unsupported { operator, value } => (operator, value),
        };

        RawPredicate {
            field: predicate.field,
            operator,
            value,
        }
    }
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
