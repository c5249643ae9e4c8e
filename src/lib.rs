//! Kuba Rollup - rule-driven, multi-tenant time-series rollups for event data
//!
//! Projects register aggregation rules (COUNT, SUM_X, UNIQUE_X, ...) over a
//! native interval. Incoming events are folded into per-bucket, per-group
//! accumulators, closed buckets are flushed to an append-only store, and
//! queries roll native buckets up into any compatible coarser interval.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kuba_rollup::clock::ManualClock;
//! use kuba_rollup::interval::Interval;
//! use kuba_rollup::rule::{AggregationRule, AggregationType, FieldScript, RuleId};
//! use kuba_rollup::{Event, QueryRequest, RollupEngine};
//!
//! # fn main() -> kuba_rollup::Result<()> {
//! let clock = Arc::new(ManualClock::new(0));
//! let engine = RollupEngine::builder().with_clock(clock.clone()).build()?;
//! engine.create_project("shop")?;
//! engine.register_rule(
//!     AggregationRule::builder("shop", AggregationType::SumX, Interval::days(1)?)
//!         .id("revenue")
//!         .value(FieldScript::new("amount"))
//!         .build()?,
//! )?;
//!
//! engine.ingest(&Event::new("shop", "purchase", "alice", 60).with_field("amount", 12.5))?;
//! clock.set(86_400);
//! engine.flush();
//!
//! let result = engine.analyze(&QueryRequest::new("shop", RuleId::new("revenue")?).frame(2))?;
//! assert_eq!(result.frames[0].groups["_all"].as_f64(), Some(12.5));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod interval;
pub mod metastore;
pub mod rule;
pub mod storage;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Accumulation, flush and query-time rollup
pub mod aggregation;

/// Background service lifecycle
pub mod services;

/// Engine facade wiring everything together
pub mod engine;

// Re-export main types
pub use aggregation::{AggregateValue, FlushReport, IngestReport, QueryRequest, QueryResult};
pub use config::Config;
pub use engine::{RollupEngine, RollupEngineBuilder};
pub use error::{Error, Result};
pub use types::{Event, FieldValue, GroupKey, ProjectId, Timestamp};
