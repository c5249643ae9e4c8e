//! Query Benchmarks
//!
//! Measures rollup cost as the number of native buckets folded into each
//! frame grows.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use kuba_rollup::clock::ManualClock;
use kuba_rollup::interval::Interval;
use kuba_rollup::rule::{AggregationRule, AggregationType, FieldScript, RuleId};
use kuba_rollup::{Event, QueryRequest, RollupEngine};
use std::hint::black_box;
use std::sync::Arc;

const HOUR: i64 = 3_600;
const DAYS: i64 = 30;

/// Thirty days of hourly buckets, flushed
fn create_populated_engine() -> RollupEngine {
    let clock = Arc::new(ManualClock::new(DAYS * 24 * HOUR));
    let engine = RollupEngine::builder()
        .with_clock(clock)
        .build()
        .expect("engine");
    engine.create_project("bench").expect("project");
    for (id, aggregation) in [("sum", AggregationType::SumX), ("unique", AggregationType::UniqueX)] {
        let rule = AggregationRule::builder("bench", aggregation, Interval::hours(1).expect("interval"))
            .id(id)
            .value(FieldScript::new("amount"))
            .group_by(FieldScript::new("country"))
            .build()
            .expect("rule");
        engine.register_rule(rule).expect("register");
    }

    let events: Vec<Event> = (0..DAYS * 24 * 20)
        .map(|i| {
            Event::new("bench", "purchase", "a", i * HOUR / 20)
                .with_field("amount", (i % 50) as f64)
                .with_field("country", if i % 3 == 0 { "DE" } else { "FR" })
        })
        .collect();
    engine.ingest_batch(&events).expect("ingest");
    engine.flush();
    engine
}

fn bench_rollup_width(c: &mut Criterion) {
    let engine = create_populated_engine();
    let mut group = c.benchmark_group("rollup_width");

    for (label, interval, frames) in [
        ("1h", Interval::hours(1), 24usize),
        ("6h", Interval::hours(6), 24),
        ("1d", Interval::days(1), 30),
    ] {
        let interval = interval.expect("interval");
        for rule in ["sum", "unique"] {
            let request = QueryRequest::new("bench", RuleId::new(rule).expect("id"))
                .interval(interval)
                .frame(frames);
            group.bench_with_input(BenchmarkId::new(rule, label), &request, |b, request| {
                b.iter(|| black_box(engine.analyze(request).expect("query")));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_rollup_width);
criterion_main!(benches);
