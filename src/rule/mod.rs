//! Aggregation rules
//!
//! A rule tells the engine what to accumulate for one project: which events
//! count (filter), what to read from them (value script), how to partition
//! them (group-by script), which [`AggregationType`] to apply, and at which
//! native [`Interval`] to bucket the result.
//!
//! The analyses a query may ask for are fixed by the aggregation type; see
//! [`AggregationType::supported_analyses`].
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::interval::Interval;
//! use kuba_rollup::rule::{AggregationRule, AggregationType, AnalysisType};
//! use kuba_rollup::rule::script::FieldScript;
//!
//! let rule = AggregationRule::builder("shop", AggregationType::AverageX, Interval::days(1).unwrap())
//!     .value(FieldScript::new("amount"))
//!     .group_by(FieldScript::new("currency"))
//!     .build()
//!     .unwrap();
//!
//! assert!(rule.aggregation().supports(AnalysisType::SumX));
//! assert!(!rule.aggregation().supports(AnalysisType::MaximumX));
//! ```

pub mod registry;
pub mod script;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::interval::Interval;
use crate::types::{Event, FieldValue, GroupKey, ProjectId};

pub use registry::RuleRegistry;
pub use script::{EventFilter, FieldExtractor, FieldScript, FilterExpr};

// ============================================================================
// Aggregation and analysis types
// ============================================================================

/// What a rule accumulates per bucket and group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationType {
    /// Number of matching events
    Count,
    /// Number of matching events carrying a value
    CountX,
    /// Sum of numeric values
    SumX,
    /// Largest numeric value
    MaximumX,
    /// Smallest numeric value
    MinimumX,
    /// Mean of numeric values
    AverageX,
    /// Approximate number of distinct values
    UniqueX,
    /// Exact set of distinct values
    SelectUniqueX,
}

/// What a query renders from stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisType {
    /// Event count
    Count,
    /// Count of events with a value
    CountX,
    /// Sum of values
    SumX,
    /// Maximum value
    MaximumX,
    /// Minimum value
    MinimumX,
    /// Mean value
    AverageX,
    /// Number of distinct values
    CountUniqueX,
    /// The distinct values themselves
    SelectUniqueX,
}

impl AggregationType {
    /// All aggregation types
    pub const ALL: [AggregationType; 8] = [
        AggregationType::Count,
        AggregationType::CountX,
        AggregationType::SumX,
        AggregationType::MaximumX,
        AggregationType::MinimumX,
        AggregationType::AverageX,
        AggregationType::UniqueX,
        AggregationType::SelectUniqueX,
    ];

    /// Wire name, e.g. `AVERAGE_X`
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Count => "COUNT",
            AggregationType::CountX => "COUNT_X",
            AggregationType::SumX => "SUM_X",
            AggregationType::MaximumX => "MAXIMUM_X",
            AggregationType::MinimumX => "MINIMUM_X",
            AggregationType::AverageX => "AVERAGE_X",
            AggregationType::UniqueX => "UNIQUE_X",
            AggregationType::SelectUniqueX => "SELECT_UNIQUE_X",
        }
    }

    /// Whether the rule needs a value script
    pub fn requires_value(&self) -> bool {
        !matches!(self, AggregationType::Count)
    }

    /// Whether the value must be numeric
    pub fn requires_numeric(&self) -> bool {
        matches!(
            self,
            AggregationType::SumX
                | AggregationType::MaximumX
                | AggregationType::MinimumX
                | AggregationType::AverageX
        )
    }

    /// Analyses that can be rendered from this type's state
    pub fn supported_analyses(&self) -> &'static [AnalysisType] {
        use AnalysisType as A;
        match self {
            AggregationType::Count => &[A::Count],
            AggregationType::CountX => &[A::CountX],
            AggregationType::SumX => &[A::SumX],
            AggregationType::MaximumX => &[A::MaximumX],
            AggregationType::MinimumX => &[A::MinimumX],
            AggregationType::AverageX => &[A::AverageX, A::SumX, A::CountX],
            AggregationType::UniqueX => &[A::CountUniqueX, A::SelectUniqueX],
            AggregationType::SelectUniqueX => &[A::SelectUniqueX, A::CountUniqueX],
        }
    }

    /// Analysis used when a query does not name one
    pub fn natural_analysis(&self) -> AnalysisType {
        self.supported_analyses()[0]
    }

    /// Whether `analysis` is defined for this type
    pub fn supports(&self, analysis: AnalysisType) -> bool {
        self.supported_analyses().contains(&analysis)
    }
}

impl AnalysisType {
    /// Wire name, e.g. `COUNT_UNIQUE_X`
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Count => "COUNT",
            AnalysisType::CountX => "COUNT_X",
            AnalysisType::SumX => "SUM_X",
            AnalysisType::MaximumX => "MAXIMUM_X",
            AnalysisType::MinimumX => "MINIMUM_X",
            AnalysisType::AverageX => "AVERAGE_X",
            AnalysisType::CountUniqueX => "COUNT_UNIQUE_X",
            AnalysisType::SelectUniqueX => "SELECT_UNIQUE_X",
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        AggregationType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ValidationError::InvalidName {
                kind: "aggregation",
                name: s.to_string(),
                reason: "unknown aggregation type".to_string(),
            })
    }
}

impl FromStr for AnalysisType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use AnalysisType as A;
        let wanted = s.trim().to_ascii_uppercase();
        [
            A::Count,
            A::CountX,
            A::SumX,
            A::MaximumX,
            A::MinimumX,
            A::AverageX,
            A::CountUniqueX,
            A::SelectUniqueX,
        ]
        .into_iter()
        .find(|t| t.as_str() == wanted)
        .ok_or_else(|| ValidationError::InvalidName {
            kind: "analysis",
            name: s.to_string(),
            reason: "unknown analysis type".to_string(),
        })
    }
}

// ============================================================================
// Rule identity
// ============================================================================

/// Rule identifier, unique within a project
///
/// Only ASCII letters, digits, `_` and `-` are accepted, which keeps ids
/// usable as storage path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleId(String);

impl RuleId {
    /// Validate and wrap an id
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id.len() > 128 {
            Some("must be at most 128 characters")
        } else if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            Some("only ASCII letters, digits, '_' and '-' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ValidationError::InvalidName {
                kind: "rule",
                name: id,
                reason: reason.to_string(),
            }),
            None => Ok(Self(id)),
        }
    }

    /// Id text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RuleId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RuleId::new(value)
    }
}

impl From<RuleId> for String {
    fn from(id: RuleId) -> Self {
        id.0
    }
}

// ============================================================================
// Rule
// ============================================================================

/// Declarative aggregation rule
///
/// Immutable once built. Scripts are shared behind `Arc`, so cloning a rule
/// is cheap.
#[derive(Debug, Clone)]
pub struct AggregationRule {
    id: RuleId,
    project: ProjectId,
    aggregation: AggregationType,
    interval: Interval,
    value: Option<Arc<dyn FieldExtractor>>,
    group_by: Option<Arc<dyn FieldExtractor>>,
    filter: Option<Arc<dyn EventFilter>>,
}

impl AggregationRule {
    /// Start building a rule
    pub fn builder(
        project: impl Into<ProjectId>,
        aggregation: AggregationType,
        interval: Interval,
    ) -> AggregationRuleBuilder {
        AggregationRuleBuilder {
            id: None,
            project: project.into(),
            aggregation,
            interval,
            value: None,
            group_by: None,
            filter: None,
        }
    }

    /// Rule id
    pub fn id(&self) -> &RuleId {
        &self.id
    }

    /// Owning project
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Aggregation type
    pub fn aggregation(&self) -> AggregationType {
        self.aggregation
    }

    /// Native bucket interval
    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Value script, if any
    pub fn value_script(&self) -> Option<&Arc<dyn FieldExtractor>> {
        self.value.as_ref()
    }

    /// Whether the event passes the filter (no filter accepts everything)
    pub fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(event))
    }

    /// Value the rule aggregates for `event`
    pub fn value(&self, event: &Event) -> Option<FieldValue> {
        self.value.as_ref().and_then(|script| script.extract(event))
    }

    /// Group the event contributes to
    pub fn group_key(&self, event: &Event) -> GroupKey {
        self.group_by
            .as_ref()
            .and_then(|script| script.extract(event))
            .map(|value| GroupKey::from(&value))
            .unwrap_or_else(GroupKey::implicit)
    }

    /// One-line description of the rule definition
    pub fn describe(&self) -> String {
        let mut text = format!("{} every {}", self.aggregation, self.interval);
        if let Some(value) = &self.value {
            text.push_str(&format!(" of {}", value.describe()));
        }
        if let Some(group_by) = &self.group_by {
            text.push_str(&format!(" by {}", group_by.describe()));
        }
        if let Some(filter) = &self.filter {
            text.push_str(&format!(" where {}", filter.describe()));
        }
        text
    }
}

/// Builder for [`AggregationRule`]
pub struct AggregationRuleBuilder {
    id: Option<String>,
    project: ProjectId,
    aggregation: AggregationType,
    interval: Interval,
    value: Option<Arc<dyn FieldExtractor>>,
    group_by: Option<Arc<dyn FieldExtractor>>,
    filter: Option<Arc<dyn EventFilter>>,
}

impl AggregationRuleBuilder {
    /// Use an explicit id instead of one derived from the definition
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the value script
    pub fn value(mut self, script: impl FieldExtractor + 'static) -> Self {
        self.value = Some(Arc::new(script));
        self
    }

    /// Set the group-by script
    pub fn group_by(mut self, script: impl FieldExtractor + 'static) -> Self {
        self.group_by = Some(Arc::new(script));
        self
    }

    /// Set the filter
    pub fn filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Validate and build
    ///
    /// Without an explicit id, the id is derived from the definition, so two
    /// identical definitions in one project collide on registration.
    pub fn build(self) -> Result<AggregationRule, ValidationError> {
        if self.project.is_empty() {
            return Err(ValidationError::InvalidName {
                kind: "project",
                name: self.project,
                reason: "must not be empty".to_string(),
            });
        }
        if self.aggregation.requires_value() && self.value.is_none() {
            return Err(ValidationError::MissingValueScript(
                self.aggregation.to_string(),
            ));
        }

        let mut rule = AggregationRule {
            id: RuleId(String::new()),
            project: self.project,
            aggregation: self.aggregation,
            interval: self.interval,
            value: self.value,
            group_by: self.group_by,
            filter: self.filter,
        };

        rule.id = match self.id {
            Some(id) => RuleId::new(id)?,
            None => derived_id(&rule),
        };
        Ok(rule)
    }
}

fn derived_id(rule: &AggregationRule) -> RuleId {
    let digest = blake3::hash(rule.describe().as_bytes());
    let hex = digest.to_hex();
    RuleId(format!(
        "{}_{}_{}",
        rule.aggregation.as_str().to_ascii_lowercase(),
        rule.interval,
        &hex.as_str()[..12]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> Interval {
        Interval::days(1).unwrap()
    }

    #[test]
    fn test_compatibility_matrix() {
        use AnalysisType as A;
        assert!(AggregationType::Count.supports(A::Count));
        assert!(!AggregationType::Count.supports(A::CountX));
        assert!(AggregationType::AverageX.supports(A::SumX));
        assert!(AggregationType::AverageX.supports(A::CountX));
        assert!(!AggregationType::SumX.supports(A::AverageX));
        assert!(AggregationType::UniqueX.supports(A::SelectUniqueX));
        assert!(AggregationType::SelectUniqueX.supports(A::CountUniqueX));
        assert!(!AggregationType::MaximumX.supports(A::MinimumX));
    }

    #[test]
    fn test_natural_analysis() {
        assert_eq!(
            AggregationType::UniqueX.natural_analysis(),
            AnalysisType::CountUniqueX
        );
        assert_eq!(
            AggregationType::AverageX.natural_analysis(),
            AnalysisType::AverageX
        );
        for t in AggregationType::ALL {
            assert!(t.supports(t.natural_analysis()));
        }
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&AggregationType::SelectUniqueX).unwrap(),
            "\"SELECT_UNIQUE_X\""
        );
        assert_eq!(
            serde_json::from_str::<AnalysisType>("\"COUNT_UNIQUE_X\"").unwrap(),
            AnalysisType::CountUniqueX
        );
        assert_eq!(
            "average_x".parse::<AggregationType>().unwrap(),
            AggregationType::AverageX
        );
        assert!("median".parse::<AnalysisType>().is_err());
    }

    #[test]
    fn test_value_script_required() {
        let err = AggregationRule::builder("p", AggregationType::SumX, day())
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingValueScript("SUM_X".into()));

        assert!(AggregationRule::builder("p", AggregationType::Count, day())
            .build()
            .is_ok());
    }

    #[test]
    fn test_derived_ids_are_stable() {
        let build = || {
            AggregationRule::builder("p", AggregationType::SumX, day())
                .value(FieldScript::new("x"))
                .build()
                .unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("sum_x_1day_"));

        let other = AggregationRule::builder("p", AggregationType::SumX, day())
            .value(FieldScript::new("y"))
            .build()
            .unwrap();
        assert_ne!(a.id(), other.id());
    }

    #[test]
    fn test_explicit_id_validation() {
        assert!(AggregationRule::builder("p", AggregationType::Count, day())
            .id("daily-count_1")
            .build()
            .is_ok());
        assert!(AggregationRule::builder("p", AggregationType::Count, day())
            .id("../escape")
            .build()
            .is_err());
    }

    #[test]
    fn test_group_key_defaults_to_implicit_group() {
        let rule = AggregationRule::builder("p", AggregationType::Count, day())
            .group_by(FieldScript::new("key"))
            .build()
            .unwrap();

        let with = Event::new("p", "c", "a", 0).with_field("key", "value1");
        let without = Event::new("p", "c", "a", 0);
        assert_eq!(rule.group_key(&with), GroupKey::from("value1"));
        assert_eq!(rule.group_key(&without), GroupKey::implicit());
    }
}
