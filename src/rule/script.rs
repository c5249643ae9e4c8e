//! Value, group-by and filter scripts
//!
//! Rules evaluate three pluggable pieces against each event. Anything that
//! implements [`FieldExtractor`] or [`EventFilter`] can be used; the crate
//! ships [`FieldScript`] (read one field) and [`FilterExpr`] (a small boolean
//! expression tree).
//!
//! Besides user fields, scripts can read the reserved names `_actor`,
//! `_collection` and `_time`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Event, FieldValue};

/// Reserved name resolving to the event actor
pub const ACTOR_FIELD: &str = "_actor";
/// Reserved name resolving to the event collection
pub const COLLECTION_FIELD: &str = "_collection";
/// Reserved name resolving to the event timestamp
pub const TIME_FIELD: &str = "_time";

/// Computes a value from an event
pub trait FieldExtractor: Send + Sync + fmt::Debug {
    /// Value for `event`, `None` when absent
    fn extract(&self, event: &Event) -> Option<FieldValue>;

    /// Human readable form, also used to derive rule ids
    fn describe(&self) -> String;

    /// The user field this script reads, when it reads exactly one
    fn field_name(&self) -> Option<&str> {
        None
    }
}

/// Decides whether an event takes part in a rule
pub trait EventFilter: Send + Sync + fmt::Debug {
    /// Whether `event` passes
    fn matches(&self, event: &Event) -> bool;

    /// Human readable form, also used to derive rule ids
    fn describe(&self) -> String;
}

fn resolve(event: &Event, name: &str) -> Option<FieldValue> {
    match name {
        ACTOR_FIELD => Some(FieldValue::String(event.actor.clone())),
        COLLECTION_FIELD => Some(FieldValue::String(event.collection.clone())),
        TIME_FIELD => Some(FieldValue::Long(event.timestamp)),
        _ => event.field(name).cloned(),
    }
}

/// Reads a single field
///
/// Serializes as the bare field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldScript {
    field: String,
}

impl FieldScript {
    /// Script reading `field`
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// Script reading the event actor
    pub fn actor() -> Self {
        Self::new(ACTOR_FIELD)
    }
}

impl FieldExtractor for FieldScript {
    fn extract(&self, event: &Event) -> Option<FieldValue> {
        resolve(event, &self.field)
    }

    fn describe(&self) -> String {
        self.field.clone()
    }

    fn field_name(&self) -> Option<&str> {
        if self.field.starts_with('_') {
            None
        } else {
            Some(&self.field)
        }
    }
}

/// Boolean filter over event fields
///
/// JSON form: `{"and": [{"exists": "amount"}, {"greater_than": ["amount", 10.0]}]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpr {
    /// Field is present
    Exists(String),
    /// Field equals the value (numbers compare numerically)
    Equals(String, FieldValue),
    /// Field is present and differs from the value
    NotEquals(String, FieldValue),
    /// Numeric field is strictly greater
    GreaterThan(String, f64),
    /// Numeric field is strictly smaller
    LessThan(String, f64),
    /// All sub-expressions hold
    And(Vec<FilterExpr>),
    /// At least one sub-expression holds
    Or(Vec<FilterExpr>),
    /// Negation
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        FilterExpr::Equals(field.into(), value.into())
    }

    /// Events of one collection
    pub fn collection(name: impl Into<String>) -> Self {
        FilterExpr::Equals(
            COLLECTION_FIELD.to_string(),
            FieldValue::String(name.into()),
        )
    }

    fn evaluate(&self, event: &Event) -> bool {
        match self {
            FilterExpr::Exists(field) => resolve(event, field).is_some(),
            FilterExpr::Equals(field, expected) => resolve(event, field)
                .map_or(false, |actual| values_equal(&actual, expected)),
            FilterExpr::NotEquals(field, expected) => resolve(event, field)
                .map_or(false, |actual| !values_equal(&actual, expected)),
            FilterExpr::GreaterThan(field, bound) => {
                numeric(event, field).map_or(false, |v| v > *bound)
            },
            FilterExpr::LessThan(field, bound) => {
                numeric(event, field).map_or(false, |v| v < *bound)
            },
            FilterExpr::And(parts) => parts.iter().all(|p| p.evaluate(event)),
            FilterExpr::Or(parts) => parts.iter().any(|p| p.evaluate(event)),
            FilterExpr::Not(inner) => !inner.evaluate(event),
        }
    }
}

fn numeric(event: &Event, field: &str) -> Option<f64> {
    resolve(event, field).and_then(|v| v.as_f64())
}

fn values_equal(actual: &FieldValue, expected: &FieldValue) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

impl EventFilter for FilterExpr {
    fn matches(&self, event: &Event) -> bool {
        self.evaluate(event)
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, parts: &[FilterExpr], op: &str| {
            f.write_str("(")?;
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", op)?;
                }
                write!(f, "{}", part)?;
            }
            f.write_str(")")
        };

        match self {
            FilterExpr::Exists(field) => write!(f, "exists({})", field),
            FilterExpr::Equals(field, v) => write!(f, "{} = {:?}", field, v.render()),
            FilterExpr::NotEquals(field, v) => write!(f, "{} != {:?}", field, v.render()),
            FilterExpr::GreaterThan(field, v) => write!(f, "{} > {}", field, v),
            FilterExpr::LessThan(field, v) => write!(f, "{} < {}", field, v),
            FilterExpr::And(parts) => join(f, parts, "and"),
            FilterExpr::Or(parts) => join(f, parts, "or"),
            FilterExpr::Not(inner) => write!(f, "not {}", inner),
        }
    }
}
