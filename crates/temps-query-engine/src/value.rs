//! Literal comparison semantics shared by the evaluator and the optimizer.
//!
//! Predicates use two-valued logic: any comparison against a missing or
//! null value is false, except `= null` and `!= null` which test for
//! presence.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::cmp::Ordering;

use crate::types::{FieldType, Operator};

/// Coarse JSON kind of a literal
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

pub fn kind(value: &Value) -> ValueKind {
    match value {
        Value::Null => ValueKind::Null,
        Value::Bool(_) => ValueKind::Bool,
        Value::Number(_) => ValueKind::Number,
        Value::String(_) => ValueKind::String,
        Value::Array(_) => ValueKind::Array,
        Value::Object(_) => ValueKind::Object,
    }
}

/// Parse `YYYY-MM-DD` or an RFC 3339 timestamp
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// How string values are ordered
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum Collation {
    /// Byte-wise, the way text columns compare
    #[default]
    Text,
    /// Strings that both parse as dates compare chronologically
    Temporal,
}

impl Collation {
    pub fn for_type(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Date => Collation::Temporal,
            _ => Collation::Text,
        }
    }
}

/// Order two literals of the same kind. Mixed kinds are incomparable.
pub fn compare(a: &Value, b: &Value, collation: Collation) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) if collation == Collation::Temporal => {
            match (parse_date(x), parse_date(y)) {
                (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn equal(a: &Value, b: &Value, collation: Collation) -> bool {
    compare(a, b, collation) == Some(Ordering::Equal)
}

/// Evaluate `left <operator> right`
pub fn matches(left: &Value, operator: Operator, right: &Value, collation: Collation) -> bool {
    if right.is_null() {
        return match operator {
            Operator::Eq => left.is_null(),
            Operator::Ne => !left.is_null(),
            _ => false,
        };
    }

    if left.is_null() {
        return false;
    }

    match operator {
        Operator::Eq => equal(left, right, collation),
        Operator::Ne => compare(left, right, collation).is_some_and(|o| o != Ordering::Equal),
        Operator::Gt => compare(left, right, collation) == Some(Ordering::Greater),
        Operator::Gte => compare(left, right, collation).is_some_and(|o| o != Ordering::Less),
        Operator::Lt => compare(left, right, collation) == Some(Ordering::Less),
        Operator::Lte => compare(left, right, collation).is_some_and(|o| o != Ordering::Greater),
        Operator::In => right
            .as_array()
            .is_some_and(|items| items.iter().any(|item| equal(left, item, collation))),
        Operator::Between => match right.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                matches(left, Operator::Gte, low, collation)
                    && matches(left, Operator::Lte, high, collation)
            }
            _ => false,
        },
        Operator::Contains => match (left, right) {
            (Value::String(l), Value::String(r)) => l.contains(r.as_str()),
            _ => false,
        },
        Operator::StartsWith => match (left, right) {
            (Value::String(l), Value::String(r)) => l.starts_with(r.as_str()),
            _ => false,
        },
    }
}

/// Total order used for sorting rows: nulls first, then by `compare`,
/// falling back to the kind order for incomparable values.
pub fn sort_order(a: &Value, b: &Value, collation: Collation) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare(a, b, collation).unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b))),
    }
}

fn kind_rank(value: &Value) -> u8 {
    match kind(value) {
        ValueKind::Null => 0,
        ValueKind::Bool => 1,
        ValueKind::Number => 2,
        ValueKind::String => 3,
        ValueKind::Array => 4,
        ValueKind::Object => 5,
    }
}
