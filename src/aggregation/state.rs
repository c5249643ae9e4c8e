//! Per-type accumulator state and merge laws
//!
//! Every aggregation type maps to one [`AccumulatorState`] variant. States
//! are built in three steps:
//!
//! 1. [`Contribution::extract`] turns an event value into what the type
//!    consumes, or `None` when the event does not contribute (missing value,
//!    non-numeric input to a numeric type).
//! 2. [`AccumulatorState::apply`] folds a contribution into the state.
//! 3. [`AccumulatorState::merge`] combines two states of the same type.
//!
//! Merge is associative and commutative for every variant, with the empty
//! state as identity; COUNT and SUM merges are additive, MAX/MIN take the
//! extreme, AVERAGE carries `(sum, count)` so the combined mean is exactly
//! weighted, UNIQUE unions its sketch and SELECT_UNIQUE unions its set.
//!
//! [`AccumulatorState::render`] produces the [`AggregateValue`] an analysis
//! reports.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::hll::HyperLogLog;
use crate::error::MergeError;
use crate::rule::{AggregationType, AnalysisType};
use crate::types::FieldValue;

/// What one event adds to an accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    /// One more occurrence (COUNT, COUNT_X)
    Occurrence,
    /// A numeric value (SUM_X, MAXIMUM_X, MINIMUM_X, AVERAGE_X)
    Number(f64),
    /// A distinct-value candidate (UNIQUE_X, SELECT_UNIQUE_X)
    Member(String),
}

impl Contribution {
    /// Contribution of `value` to an `aggregation` accumulator
    pub fn extract(aggregation: AggregationType, value: Option<&FieldValue>) -> Option<Self> {
        match aggregation {
            AggregationType::Count => Some(Contribution::Occurrence),
            AggregationType::CountX => value.map(|_| Contribution::Occurrence),
            AggregationType::SumX
            | AggregationType::MaximumX
            | AggregationType::MinimumX
            | AggregationType::AverageX => value.and_then(FieldValue::as_f64).map(Contribution::Number),
            AggregationType::UniqueX | AggregationType::SelectUniqueX => {
                value.map(|v| Contribution::Member(v.render()))
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Contribution::Occurrence => "occurrence",
            Contribution::Number(_) => "number",
            Contribution::Member(_) => "member",
        }
    }
}

/// Accumulated state of one (rule, bucket, group) slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccumulatorState {
    /// COUNT and COUNT_X
    Count {
        /// Number of contributions
        count: u64,
    },
    /// SUM_X
    Sum {
        /// Running sum
        sum: f64,
    },
    /// MAXIMUM_X
    Maximum {
        /// Largest value seen
        value: Option<f64>,
    },
    /// MINIMUM_X
    Minimum {
        /// Smallest value seen
        value: Option<f64>,
    },
    /// AVERAGE_X
    Average {
        /// Running sum
        sum: f64,
        /// Number of values
        count: u64,
    },
    /// UNIQUE_X
    Unique {
        /// Cardinality sketch
        sketch: HyperLogLog,
        /// Exact members, kept for SELECT_UNIQUE_X analysis
        members: BTreeSet<String>,
    },
    /// SELECT_UNIQUE_X
    Distinct {
        /// Exact members
        members: BTreeSet<String>,
    },
}

/// Rendered result of one group in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateValue {
    /// Counts and cardinalities
    Integer(u64),
    /// Sums, extremes and means
    Number(f64),
    /// Distinct members, sorted
    Members(Vec<String>),
}

impl AggregateValue {
    /// Numeric view (counts widen to `f64`)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AggregateValue::Integer(v) => Some(*v as f64),
            AggregateValue::Number(v) => Some(*v),
            AggregateValue::Members(_) => None,
        }
    }

    /// Integer view
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AggregateValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Member list view
    pub fn as_members(&self) -> Option<&[String]> {
        match self {
            AggregateValue::Members(m) => Some(m),
            _ => None,
        }
    }
}

impl AccumulatorState {
    /// Merge identity for `aggregation`
    pub fn empty(aggregation: AggregationType, unique_precision: u8) -> Self {
        match aggregation {
            AggregationType::Count | AggregationType::CountX => AccumulatorState::Count { count: 0 },
            AggregationType::SumX => AccumulatorState::Sum { sum: 0.0 },
            AggregationType::MaximumX => AccumulatorState::Maximum { value: None },
            AggregationType::MinimumX => AccumulatorState::Minimum { value: None },
            AggregationType::AverageX => AccumulatorState::Average { sum: 0.0, count: 0 },
            AggregationType::UniqueX => AccumulatorState::Unique {
                sketch: HyperLogLog::new(unique_precision),
                members: BTreeSet::new(),
            },
            AggregationType::SelectUniqueX => AccumulatorState::Distinct {
                members: BTreeSet::new(),
            },
        }
    }

    /// Variant name, used in merge errors
    pub fn kind(&self) -> &'static str {
        match self {
            AccumulatorState::Count { .. } => "count",
            AccumulatorState::Sum { .. } => "sum",
            AccumulatorState::Maximum { .. } => "maximum",
            AccumulatorState::Minimum { .. } => "minimum",
            AccumulatorState::Average { .. } => "average",
            AccumulatorState::Unique { .. } => "unique",
            AccumulatorState::Distinct { .. } => "distinct",
        }
    }

    /// Fold one contribution into the state
    pub fn apply(&mut self, contribution: &Contribution) -> Result<(), MergeError> {
        match (&mut *self, contribution) {
            (AccumulatorState::Count { count }, Contribution::Occurrence) => *count += 1,
            (AccumulatorState::Sum { sum }, Contribution::Number(v)) => *sum += v,
            (AccumulatorState::Maximum { value }, Contribution::Number(v)) => {
                *value = Some(value.map_or(*v, |current| current.max(*v)));
            },
            (AccumulatorState::Minimum { value }, Contribution::Number(v)) => {
                *value = Some(value.map_or(*v, |current| current.min(*v)));
            },
            (AccumulatorState::Average { sum, count }, Contribution::Number(v)) => {
                *sum += v;
                *count += 1;
            },
            (AccumulatorState::Unique { sketch, members }, Contribution::Member(m)) => {
                sketch.insert(m);
                if !members.contains(m) {
                    members.insert(m.clone());
                }
            },
            (AccumulatorState::Distinct { members }, Contribution::Member(m)) => {
                if !members.contains(m) {
                    members.insert(m.clone());
                }
            },
            (state, contribution) => {
                return Err(MergeError::StateMismatch {
                    left: state.kind(),
                    right: contribution.kind(),
                })
            },
        }
        Ok(())
    }

    /// Combine `other` into this state
    pub fn merge(&mut self, other: &AccumulatorState) -> Result<(), MergeError> {
        use AccumulatorState as S;
        match (&mut *self, other) {
            (S::Count { count }, S::Count { count: theirs }) => *count += theirs,
            (S::Sum { sum }, S::Sum { sum: theirs }) => *sum += theirs,
            (S::Maximum { value }, S::Maximum { value: theirs }) => {
                *value = extreme(*value, *theirs, f64::max);
            },
            (S::Minimum { value }, S::Minimum { value: theirs }) => {
                *value = extreme(*value, *theirs, f64::min);
            },
            (
                S::Average { sum, count },
                S::Average {
                    sum: their_sum,
                    count: their_count,
                },
            ) => {
                *sum += their_sum;
                *count += their_count;
            },
            (
                S::Unique { sketch, members },
                S::Unique {
                    sketch: their_sketch,
                    members: their_members,
                },
            ) => {
                sketch.merge(their_sketch)?;
                members.extend(their_members.iter().cloned());
            },
            (S::Distinct { members }, S::Distinct { members: theirs }) => {
                members.extend(theirs.iter().cloned());
            },
            (mine, theirs) => {
                return Err(MergeError::StateMismatch {
                    left: mine.kind(),
                    right: theirs.kind(),
                })
            },
        }
        Ok(())
    }

    /// Render the value `analysis` reports
    ///
    /// Returns `None` when the analysis is not defined for this state, or
    /// when an extreme has not seen any value yet.
    pub fn render(&self, analysis: AnalysisType) -> Option<AggregateValue> {
        use AccumulatorState as S;
        use AnalysisType as A;
        let value = match (self, analysis) {
            (S::Count { count }, A::Count | A::CountX) => AggregateValue::Integer(*count),
            (S::Sum { sum }, A::SumX) => AggregateValue::Number(*sum),
            (S::Maximum { value }, A::MaximumX) => AggregateValue::Number((*value)?),
            (S::Minimum { value }, A::MinimumX) => AggregateValue::Number((*value)?),
            (S::Average { sum, count }, A::AverageX) => {
                if *count == 0 {
                    return None;
                }
                AggregateValue::Number(sum / *count as f64)
            },
            (S::Average { sum, .. }, A::SumX) => AggregateValue::Number(*sum),
            (S::Average { count, .. }, A::CountX) => AggregateValue::Integer(*count),
            (S::Unique { sketch, .. }, A::CountUniqueX) => AggregateValue::Integer(sketch.count()),
            (S::Unique { members, .. } | S::Distinct { members }, A::SelectUniqueX) => {
                AggregateValue::Members(members.iter().cloned().collect())
            },
            (S::Distinct { members }, A::CountUniqueX) => {
                AggregateValue::Integer(members.len() as u64)
            },
            _ => return None,
        };
        Some(value)
    }
}

fn extreme(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const P: u8 = 12;

    fn fold(aggregation: AggregationType, values: &[f64]) -> AccumulatorState {
        let mut state = AccumulatorState::empty(aggregation, P);
        for v in values {
            let c = Contribution::extract(aggregation, Some(&FieldValue::Double(*v))).unwrap();
            state.apply(&c).unwrap();
        }
        state
    }

    fn members(values: &[u16]) -> AccumulatorState {
        let mut state = AccumulatorState::empty(AggregationType::UniqueX, P);
        for v in values {
            state
                .apply(&Contribution::Member(v.to_string()))
                .unwrap();
        }
        state
    }

    #[test]
    fn test_contribution_extraction() {
        let text = FieldValue::from("abc");
        let num = FieldValue::from(3);
        assert_eq!(
            Contribution::extract(AggregationType::Count, None),
            Some(Contribution::Occurrence)
        );
        assert_eq!(Contribution::extract(AggregationType::CountX, None), None);
        assert_eq!(
            Contribution::extract(AggregationType::CountX, Some(&text)),
            Some(Contribution::Occurrence)
        );
        assert_eq!(Contribution::extract(AggregationType::SumX, Some(&text)), None);
        assert_eq!(
            Contribution::extract(AggregationType::SumX, Some(&num)),
            Some(Contribution::Number(3.0))
        );
        assert_eq!(
            Contribution::extract(AggregationType::UniqueX, Some(&num)),
            Some(Contribution::Member("3".into()))
        );
    }

    #[test]
    fn test_average_is_weighted() {
        let mut a = fold(AggregationType::AverageX, &[10.0]);
        let b = fold(AggregationType::AverageX, &[20.0, 20.0, 20.0]);
        a.merge(&b).unwrap();
        assert_eq!(a.render(AnalysisType::AverageX), Some(AggregateValue::Number(17.5)));
        assert_eq!(a.render(AnalysisType::SumX), Some(AggregateValue::Number(70.0)));
        assert_eq!(a.render(AnalysisType::CountX), Some(AggregateValue::Integer(4)));
    }

    #[test]
    fn test_extremes() {
        let mut max = fold(AggregationType::MaximumX, &[3.0, 99.0, -1.0]);
        max.merge(&AccumulatorState::empty(AggregationType::MaximumX, P)).unwrap();
        assert_eq!(max.render(AnalysisType::MaximumX), Some(AggregateValue::Number(99.0)));

        let min = fold(AggregationType::MinimumX, &[3.0, 99.0, -1.0]);
        assert_eq!(min.render(AnalysisType::MinimumX), Some(AggregateValue::Number(-1.0)));

        let empty = AccumulatorState::empty(AggregationType::MaximumX, P);
        assert_eq!(empty.render(AnalysisType::MaximumX), None);
    }

    #[test]
    fn test_unique_supports_both_analyses() {
        let mut a = members(&[1, 2, 3]);
        a.merge(&members(&[3, 4])).unwrap();
        assert_eq!(a.render(AnalysisType::CountUniqueX), Some(AggregateValue::Integer(4)));
        assert_eq!(
            a.render(AnalysisType::SelectUniqueX),
            Some(AggregateValue::Members(vec![
                "1".into(),
                "2".into(),
                "3".into(),
                "4".into()
            ]))
        );
    }

    #[test]
    fn test_distinct_counts_exactly() {
        let mut state = AccumulatorState::empty(AggregationType::SelectUniqueX, P);
        for m in ["b", "a", "b"] {
            state.apply(&Contribution::Member(m.into())).unwrap();
        }
        assert_eq!(state.render(AnalysisType::CountUniqueX), Some(AggregateValue::Integer(2)));
        assert_eq!(state.render(AnalysisType::MaximumX), None);
    }

    #[test]
    fn test_mismatched_merge_is_rejected() {
        let mut count = AccumulatorState::empty(AggregationType::Count, P);
        let sum = AccumulatorState::empty(AggregationType::SumX, P);
        assert_eq!(
            count.merge(&sum),
            Err(MergeError::StateMismatch {
                left: "count",
                right: "sum"
            })
        );
        assert!(count.apply(&Contribution::Number(1.0)).is_err());
    }

    #[test]
    fn test_state_serializes_with_kind_tag() {
        let state = fold(AggregationType::AverageX, &[1.0, 2.0]);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], "average");
        let back: AccumulatorState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    fn numeric_type() -> impl Strategy<Value = AggregationType> {
        prop_oneof![
            Just(AggregationType::CountX),
            Just(AggregationType::SumX),
            Just(AggregationType::MaximumX),
            Just(AggregationType::MinimumX),
            Just(AggregationType::AverageX),
        ]
    }

    fn merged(a: &AccumulatorState, b: &AccumulatorState) -> AccumulatorState {
        let mut out = a.clone();
        out.merge(b).unwrap();
        out
    }

    fn assert_close(a: &AccumulatorState, b: &AccumulatorState, analysis: AnalysisType) {
        let x = a.render(analysis).and_then(|v| v.as_f64());
        let y = b.render(analysis).and_then(|v| v.as_f64());
        match (x, y) {
            (Some(x), Some(y)) => assert!((x - y).abs() <= 1e-6 * (1.0 + x.abs())),
            (x, y) => assert_eq!(x, y),
        }
    }

    proptest! {
        #[test]
        fn prop_merge_matches_single_fold(
            aggregation in numeric_type(),
            left in prop::collection::vec(-1_000i32..1_000, 0..40),
            right in prop::collection::vec(-1_000i32..1_000, 0..40),
        ) {
            let left: Vec<f64> = left.into_iter().map(f64::from).collect();
            let right: Vec<f64> = right.into_iter().map(f64::from).collect();
            let all: Vec<f64> = left.iter().chain(right.iter()).copied().collect();

            let combined = merged(&fold(aggregation, &left), &fold(aggregation, &right));
            let direct = fold(aggregation, &all);
            assert_close(&combined, &direct, aggregation.natural_analysis());
        }

        #[test]
        fn prop_merge_is_commutative_and_associative(
            aggregation in numeric_type(),
            a in prop::collection::vec(-100i32..100, 0..20),
            b in prop::collection::vec(-100i32..100, 0..20),
            c in prop::collection::vec(-100i32..100, 0..20),
        ) {
            let to_state = |v: Vec<i32>| {
                fold(aggregation, &v.into_iter().map(f64::from).collect::<Vec<_>>())
            };
            let (a, b, c) = (to_state(a), to_state(b), to_state(c));
            let analysis = aggregation.natural_analysis();

            assert_close(&merged(&a, &b), &merged(&b, &a), analysis);
            assert_close(
                &merged(&merged(&a, &b), &c),
                &merged(&a, &merged(&b, &c)),
                analysis,
            );
        }

        #[test]
        fn prop_extreme_merge_with_self_is_unchanged(
            aggregation in prop_oneof![Just(AggregationType::MaximumX), Just(AggregationType::MinimumX)],
            values in prop::collection::vec(-1.0e6f64..1.0e6, 0..40),
        ) {
            let state = fold(aggregation, &values);
            prop_assert_eq!(merged(&state, &state), state.clone());

            // Folding a bucket in twice during rollup changes nothing either
            let twice = merged(&merged(&state, &state), &state);
            prop_assert_eq!(twice.render(aggregation.natural_analysis()), state.render(aggregation.natural_analysis()));
        }

        #[test]
        fn prop_empty_is_identity(values in prop::collection::vec(0u16..500, 0..50)) {
            let state = members(&values);
            let empty = AccumulatorState::empty(AggregationType::UniqueX, P);
            prop_assert_eq!(merged(&state, &empty), state.clone());
            prop_assert_eq!(merged(&empty, &state), state);
        }
    }
}
