//! Rule-Driven Aggregation
//!
//! Events flow through three stages, each owning one concern:
//!
//! ```text
//! ┌─────────────────┐  apply   ┌──────────────────┐  take/write  ┌─────────────┐
//! │ EventAggregator │─────────▶│ LiveAccumulator  │─────────────▶│ BucketStore │
//! │  rule matching  │          │ (project, rule,  │   Collector  │  finalized  │
//! └─────────────────┘          │  bucket, group)  │              └──────┬──────┘
//!                              └──────────────────┘                     │ read
//!                                                              ┌────────▼──────┐
//!                                                              │ EventAnalyzer │
//!                                                              │ merge, render │
//!                                                              └───────────────┘
//! ```
//!
//! # Key Components
//!
//! - **AccumulatorState**: one closed variant per aggregation type, carrying
//!   the update, merge and render laws
//! - **HyperLogLog**: mergeable cardinality sketch for UNIQUE_X
//! - **LiveAccumulator**: sharded map of open slots; same-key updates are
//!   serialized by the shard lock, different keys never contend
//! - **Collector**: moves closed slots into the store without losing
//!   concurrent contributions
//! - **EventAnalyzer**: rolls native buckets up into query buckets

pub mod accumulator;
pub mod aggregator;
pub mod analyzer;
pub mod collector;
pub mod hll;
pub mod state;

pub use accumulator::{LiveAccumulator, LiveSlot, SlotKey};
pub use aggregator::{EventAggregator, IngestReport};
pub use analyzer::{EventAnalyzer, Frame, QueryRequest, QueryResult};
pub use collector::{Collector, CollectorService, FlushReport, FlushScope, RuleFlush};
pub use hll::HyperLogLog;
pub use state::{AccumulatorState, AggregateValue, Contribution};
