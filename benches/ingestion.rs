//! Ingestion Benchmarks
//!
//! Measures event throughput through rule matching and live accumulation,
//! single-threaded and with several writers sharing one engine.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kuba_rollup::clock::ManualClock;
use kuba_rollup::interval::Interval;
use kuba_rollup::rule::{AggregationRule, AggregationType, FieldScript};
use kuba_rollup::{Event, RollupEngine};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

// =============================================================================
// Test Data Generators
// =============================================================================

/// Engine with `rules` daily rules of mixed types on project "bench"
fn create_engine(rules: usize) -> Arc<RollupEngine> {
    let engine = RollupEngine::builder()
        .with_clock(Arc::new(ManualClock::new(0)))
        .build()
        .expect("engine");
    engine.create_project("bench").expect("project");

    let kinds = [
        AggregationType::Count,
        AggregationType::SumX,
        AggregationType::AverageX,
        AggregationType::UniqueX,
    ];
    for i in 0..rules {
        let rule = AggregationRule::builder("bench", kinds[i % kinds.len()], Interval::hours(1).expect("interval"))
            .id(format!("rule_{}", i))
            .value(FieldScript::new("amount"))
            .group_by(FieldScript::new("country"))
            .build()
            .expect("rule");
        engine.register_rule(rule).expect("register");
    }
    Arc::new(engine)
}

fn create_events(count: usize) -> Vec<Event> {
    const COUNTRIES: [&str; 4] = ["DE", "FR", "US", "JP"];
    (0..count)
        .map(|i| {
            Event::new("bench", "purchase", format!("user-{}", i % 997), (i as i64) % 86_400)
                .with_field("amount", (i % 100) as f64 + 0.5)
                .with_field("country", COUNTRIES[i % COUNTRIES.len()])
        })
        .collect()
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_ingest_by_rule_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_rules");
    let events = create_events(10_000);

    for rules in [1usize, 4, 16] {
        let engine = create_engine(rules);
        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rules), &rules, |b, _| {
            b.iter(|| black_box(engine.ingest_batch(&events).expect("ingest")));
        });
    }
    group.finish();
}

fn bench_parallel_writers(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_writers");
    group.sample_size(20);
    let events = Arc::new(create_events(5_000));

    for writers in [1usize, 2, 4, 8] {
        let engine = create_engine(4);
        group.throughput(Throughput::Elements((events.len() * writers) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(writers), &writers, |b, &writers| {
            b.iter(|| {
                let handles: Vec<_> = (0..writers)
                    .map(|_| {
                        let engine = Arc::clone(&engine);
                        let events = Arc::clone(&events);
                        thread::spawn(move || engine.ingest_batch(&events).expect("ingest"))
                    })
                    .collect();
                for handle in handles {
                    black_box(handle.join().expect("writer"));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ingest_by_rule_count, bench_parallel_writers);
criterion_main!(benches);
