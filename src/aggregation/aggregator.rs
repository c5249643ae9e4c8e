//! Event ingestion
//!
//! [`EventAggregator::aggregate`] runs every rule of the event's project
//! against the event and folds the result into the live accumulator. Rules
//! are evaluated in registration order but are independent of one another:
//! a rule that skips the event never prevents later rules from updating.

use std::sync::Arc;

use super::accumulator::{LiveAccumulator, SlotKey};
use super::state::Contribution;
use crate::error::{Error, Result};
use crate::metastore::Metastore;
use crate::metrics;
use crate::rule::RuleRegistry;
use crate::types::Event;

/// Per-event ingestion summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Rules whose accumulator was updated
    pub updated: usize,
    /// Rules whose filter rejected the event
    pub filtered: usize,
    /// Rules that could not use the event's value (missing or wrong type)
    pub skipped: usize,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.updated += other.updated;
        self.filtered += other.filtered;
        self.skipped += other.skipped;
    }
}

/// Applies rules to incoming events
pub struct EventAggregator {
    registry: Arc<RuleRegistry>,
    accumulator: Arc<LiveAccumulator>,
    metastore: Arc<dyn Metastore>,
}

impl EventAggregator {
    /// Create an aggregator over shared rule, accumulator and metastore state
    pub fn new(
        registry: Arc<RuleRegistry>,
        accumulator: Arc<LiveAccumulator>,
        metastore: Arc<dyn Metastore>,
    ) -> Self {
        Self {
            registry,
            accumulator,
            metastore,
        }
    }

    /// Fold one event into every applicable rule
    ///
    /// Fails only when the project is unknown; nothing is updated then.
    pub fn aggregate(&self, event: &Event) -> Result<IngestReport> {
        if !self.metastore.project_exists(&event.project) {
            metrics::record_event("unknown_project");
            metrics::record_error("project_not_found", "ingest");
            return Err(Error::ProjectNotFound(event.project.clone()));
        }

        let mut report = IngestReport::default();
        for rule in self.registry.rules(&event.project).iter() {
            let aggregation = rule.aggregation();

            if !rule.accepts(event) {
                report.filtered += 1;
                metrics::record_rule_update(aggregation.as_str(), "filtered");
                continue;
            }

            let value = if aggregation.requires_value() {
                rule.value(event)
            } else {
                None
            };
            let Some(contribution) = Contribution::extract(aggregation, value.as_ref()) else {
                report.skipped += 1;
                metrics::record_rule_update(aggregation.as_str(), "skipped");
                if value.is_some() {
                    tracing::warn!(
                        rule_id = %rule.id(),
                        aggregation = %aggregation,
                        "Non-numeric value skipped"
                    );
                }
                continue;
            };

            let Some(bucket) = rule.interval().checked_span_start(event.timestamp) else {
                report.skipped += 1;
                metrics::record_rule_update(aggregation.as_str(), "skipped");
                tracing::warn!(
                    rule_id = %rule.id(),
                    timestamp = event.timestamp,
                    "Event bucket outside the timestamp range, skipped"
                );
                continue;
            };

            let key = SlotKey {
                project: event.project.clone(),
                rule_id: rule.id().clone(),
                bucket,
                group: rule.group_key(event),
            };
            if let Err(e) = self.accumulator.apply(key, aggregation, &contribution) {
                report.skipped += 1;
                metrics::record_rule_update(aggregation.as_str(), "skipped");
                metrics::record_error("merge", "ingest");
                tracing::warn!(
                    rule_id = %rule.id(),
                    aggregation = %aggregation,
                    error = %e,
                    "Live slot rejected the update, skipped"
                );
                continue;
            }
            report.updated += 1;
            metrics::record_rule_update(aggregation.as_str(), "updated");
        }

        metrics::record_event("accepted");
        Ok(report)
    }

    /// Aggregate a batch; stops at the first unknown project
    pub fn aggregate_all<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> Result<IngestReport> {
        let mut total = IngestReport::default();
        for event in events {
            total.absorb(self.aggregate(event)?);
        }
        metrics::update_live_slots(self.accumulator.len());
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::state::{AccumulatorState, AggregateValue};
    use crate::interval::Interval;
    use crate::metastore::InMemoryMetastore;
    use crate::rule::{AggregationRule, AggregationType, AnalysisType, FieldScript, FilterExpr, RuleId};
    use crate::types::GroupKey;

    const DAY: i64 = 86_400;

    struct Fixture {
        registry: Arc<RuleRegistry>,
        accumulator: Arc<LiveAccumulator>,
        aggregator: EventAggregator,
    }

    fn fixture() -> Fixture {
        let metastore = Arc::new(InMemoryMetastore::new());
        metastore.create_project("shop").unwrap();
        let registry = Arc::new(RuleRegistry::new());
        let accumulator = Arc::new(LiveAccumulator::new(12));
        let aggregator = EventAggregator::new(
            Arc::clone(&registry),
            Arc::clone(&accumulator),
            metastore,
        );
        Fixture {
            registry,
            accumulator,
            aggregator,
        }
    }

    fn state(f: &Fixture, rule: &str, bucket: i64, group: &str) -> Option<AccumulatorState> {
        f.accumulator
            .snapshot(&SlotKey {
                project: "shop".to_string(),
                rule_id: RuleId::new(rule).unwrap(),
                bucket,
                group: GroupKey::from(group),
            })
            .map(|slot| slot.state)
    }

    #[test]
    fn test_unknown_project_is_rejected() {
        let f = fixture();
        let err = f.aggregator.aggregate(&Event::new("ghost", "c", "a", 0)).unwrap_err();
        assert!(matches!(err, Error::ProjectNotFound(p) if p == "ghost"));
    }

    #[test]
    fn test_project_without_rules_is_a_no_op() {
        let f = fixture();
        let report = f.aggregator.aggregate(&Event::new("shop", "c", "a", 0)).unwrap();
        assert_eq!(report, IngestReport::default());
        assert!(f.accumulator.is_empty());
    }

    #[test]
    fn test_bucket_and_group_routing() {
        let f = fixture();
        f.registry
            .register(
                AggregationRule::builder("shop", AggregationType::Count, Interval::days(1).unwrap())
                    .id("count")
                    .group_by(FieldScript::new("key"))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let events = [
            Event::new("shop", "c", "a", 10).with_field("key", "value1"),
            Event::new("shop", "c", "a", DAY - 1).with_field("key", "value1"),
            Event::new("shop", "c", "a", DAY).with_field("key", "value1"),
            Event::new("shop", "c", "a", 20),
        ];
        let report = f.aggregator.aggregate_all(&events).unwrap();
        assert_eq!(report.updated, 4);

        let count = |bucket, group| {
            state(&f, "count", bucket, group)
                .and_then(|s| s.render(AnalysisType::Count))
                .and_then(|v| v.as_u64())
        };
        assert_eq!(count(0, "value1"), Some(2));
        assert_eq!(count(DAY, "value1"), Some(1));
        assert_eq!(count(0, GroupKey::IMPLICIT), Some(1));
    }

    #[test]
    fn test_rules_are_independent() {
        let f = fixture();
        let day = Interval::days(1).unwrap();
        f.registry
            .register(
                AggregationRule::builder("shop", AggregationType::SumX, day)
                    .id("sum")
                    .value(FieldScript::new("amount"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        f.registry
            .register(
                AggregationRule::builder("shop", AggregationType::Count, day)
                    .id("purchases")
                    .filter(FilterExpr::collection("purchase"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        f.registry
            .register(
                AggregationRule::builder("shop", AggregationType::Count, day)
                    .id("all")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let report = f
            .aggregator
            .aggregate(&Event::new("shop", "view", "a", 5).with_field("amount", "n/a"))
            .unwrap();
        assert_eq!(
            report,
            IngestReport {
                updated: 1,
                filtered: 1,
                skipped: 1
            }
        );
        assert!(state(&f, "sum", 0, GroupKey::IMPLICIT).is_none());
        assert_eq!(
            state(&f, "all", 0, GroupKey::IMPLICIT).and_then(|s| s.render(AnalysisType::Count)),
            Some(AggregateValue::Integer(1))
        );
    }

    #[test]
    fn test_rejected_slot_update_does_not_stop_later_rules() {
        let f = fixture();
        let day = Interval::days(1).unwrap();
        f.registry
            .register(
                AggregationRule::builder("shop", AggregationType::SumX, day)
                    .id("total")
                    .value(FieldScript::new("amount"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        f.registry
            .register(AggregationRule::builder("shop", AggregationType::Count, day).id("all").build().unwrap())
            .unwrap();

        // A slot left behind by an earlier definition of "total"
        let stale = SlotKey {
            project: "shop".to_string(),
            rule_id: RuleId::new("total").unwrap(),
            bucket: 0,
            group: GroupKey::implicit(),
        };
        f.accumulator
            .apply(stale, AggregationType::SelectUniqueX, &Contribution::Member("x".into()))
            .unwrap();

        let report = f
            .aggregator
            .aggregate(&Event::new("shop", "c", "a", 5).with_field("amount", 5i64))
            .unwrap();
        assert_eq!(
            report,
            IngestReport {
                updated: 1,
                filtered: 0,
                skipped: 1
            }
        );
        assert_eq!(
            state(&f, "all", 0, GroupKey::IMPLICIT).and_then(|s| s.render(AnalysisType::Count)),
            Some(AggregateValue::Integer(1))
        );
    }

    #[test]
    fn test_timestamps_at_range_ends() {
        let f = fixture();
        f.registry
            .register(
                AggregationRule::builder("shop", AggregationType::Count, Interval::days(1).unwrap())
                    .id("count")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        // The bucket holding i64::MIN would start below the range
        let report = f.aggregator.aggregate(&Event::new("shop", "c", "a", i64::MIN)).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(f.accumulator.is_empty());

        let report = f.aggregator.aggregate(&Event::new("shop", "c", "a", i64::MAX)).unwrap();
        assert_eq!(report.updated, 1);
        let top = Interval::days(1).unwrap().span_start(i64::MAX);
        assert_eq!(
            state(&f, "count", top, GroupKey::IMPLICIT).and_then(|s| s.render(AnalysisType::Count)),
            Some(AggregateValue::Integer(1))
        );
    }
}
