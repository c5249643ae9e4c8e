//! Core data types shared by ingestion, flush and query
//!
//! # Key Types
//!
//! - **`Event`**: A single tracked event (project, collection, actor, timestamp, fields)
//! - **`FieldValue`**: A scalar event field value
//! - **`GroupKey`**: The partition key a rule's group-by script produces
//! - **`Timestamp`**: Seconds since the Unix epoch
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::types::{Event, FieldValue};
//!
//! let event = Event::new("shop", "purchase", "user-1", 1_700_000_000)
//!     .with_field("amount", 42)
//!     .with_field("currency", "EUR");
//!
//! assert_eq!(event.field("amount").and_then(FieldValue::as_f64), Some(42.0));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Seconds since the Unix epoch
pub type Timestamp = i64;

/// Tenant identifier
pub type ProjectId = String;

/// Scalar value of an event field
///
/// Deserializes from plain JSON scalars, so `{"amount": 3}` yields `Long(3)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Long(i64),
    /// Floating point value
    Double(f64),
    /// Text value
    String(String),
}

impl FieldValue {
    /// Numeric view of the value, `None` for text and booleans
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Long(v) => Some(*v as f64),
            FieldValue::Double(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    /// Canonical text form, used for group keys and unique-value members
    pub fn render(&self) -> String {
        match self {
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Long(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
            FieldValue::String(v) => v.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Long(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// A tracked event
///
/// Events are read-only once built; ingestion only ever borrows them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Owning project
    pub project: ProjectId,
    /// Collection (event type) within the project
    pub collection: String,
    /// Actor that produced the event
    pub actor: String,
    /// Event time in seconds since the epoch
    pub timestamp: Timestamp,
    /// Event properties
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
}

impl Event {
    /// Create an event without fields
    pub fn new(
        project: impl Into<String>,
        collection: impl Into<String>,
        actor: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            project: project.into(),
            collection: collection.into(),
            actor: actor.into(),
            timestamp,
            fields: HashMap::new(),
        }
    }

    /// Add a field (builder style)
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Partition key produced by a rule's group-by script
///
/// Rules without a group-by script, and events that lack the group-by
/// field, contribute to the implicit group [`GroupKey::implicit`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey(pub String);

impl GroupKey {
    /// Label of the implicit group
    pub const IMPLICIT: &'static str = "_all";

    /// The implicit single group
    pub fn implicit() -> Self {
        Self(Self::IMPLICIT.to_string())
    }

    /// Key text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&FieldValue> for GroupKey {
    fn from(value: &FieldValue) -> Self {
        GroupKey(value.render())
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        GroupKey(value.to_string())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_from_json() {
        let event: Event = serde_json::from_str(
            r#"{"project":"p","collection":"c","actor":"a","timestamp":10,
                "fields":{"n":3,"x":1.5,"s":"hi","b":true}}"#,
        )
        .unwrap();
        assert_eq!(event.field("n"), Some(&FieldValue::Long(3)));
        assert_eq!(event.field("x"), Some(&FieldValue::Double(1.5)));
        assert_eq!(event.field("s"), Some(&FieldValue::String("hi".into())));
        assert_eq!(event.field("b"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(FieldValue::Long(7).as_f64(), Some(7.0));
        assert_eq!(FieldValue::Double(f64::NAN).as_f64(), None);
        assert_eq!(FieldValue::from("7").as_f64(), None);
        assert_eq!(FieldValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_group_key_rendering() {
        assert_eq!(GroupKey::from(&FieldValue::Long(3)).as_str(), "3");
        assert_eq!(GroupKey::from(&FieldValue::from("value1")).as_str(), "value1");
        assert_eq!(GroupKey::implicit().as_str(), "_all");
    }
}
