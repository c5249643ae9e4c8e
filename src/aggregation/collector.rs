//! Flushing live accumulator state into the bucket store
//!
//! A flush pass selects live slots, removes each one from the accumulator
//! and writes it as a [`FinalizedBucket`]. Removal is atomic per slot, so an
//! event racing with the flush either lands in the removed state or creates
//! a fresh slot with a new generation; it is never dropped. A failed write
//! merges the removed state back.
//!
//! By default only closed buckets are flushed: a slot is eligible when its
//! bucket starts before the rule's current bucket.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kuba_rollup::aggregation::{Collector, LiveAccumulator};
//! use kuba_rollup::clock::ManualClock;
//! use kuba_rollup::rule::RuleRegistry;
//! use kuba_rollup::storage::MemoryBucketStore;
//!
//! let collector = Collector::new(
//!     Arc::new(RuleRegistry::new()),
//!     Arc::new(LiveAccumulator::new(14)),
//!     Arc::new(MemoryBucketStore::new()),
//!     Arc::new(ManualClock::new(0)),
//! );
//! let report = collector.process_registered(Default::default());
//! assert!(report.is_success());
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;

use super::accumulator::{LiveAccumulator, LiveSlot, SlotKey};
use crate::clock::Clock;
use crate::config::CollectorConfig;
use crate::metrics;
use crate::rule::{AggregationRule, RuleId, RuleRegistry};
use crate::services::{Service, ServiceError, ServiceStatus};
use crate::storage::{BucketKey, BucketStore, FinalizedBucket, WriteOutcome};
use crate::types::{ProjectId, Timestamp};

// ============================================================================
// Flush Report
// ============================================================================

/// Which live buckets a pass flushes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushScope {
    /// Buckets that start before the rule's current bucket
    #[default]
    Closed,
    /// Every live bucket, the open one included
    All,
}

/// Outcome of flushing one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFlush {
    /// Project owning the rule
    pub project: ProjectId,
    /// Flushed rule
    pub rule_id: RuleId,
    /// Buckets written
    pub created: usize,
    /// Buckets whose key was already stored
    pub duplicates: usize,
    /// Buckets put back into the accumulator after a failed write
    pub restored: usize,
    /// Store error that stopped this rule's flush
    pub error: Option<String>,
}

impl RuleFlush {
    fn new(project: ProjectId, rule_id: RuleId) -> Self {
        Self {
            project,
            rule_id,
            created: 0,
            duplicates: 0,
            restored: 0,
            error: None,
        }
    }
}

/// Outcome of a flush pass, one entry per rule that had eligible buckets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Per-rule outcomes, sorted by (project, rule)
    pub rules: Vec<RuleFlush>,
}

impl FlushReport {
    /// Total buckets written
    pub fn created(&self) -> usize {
        self.rules.iter().map(|r| r.created).sum()
    }

    /// Total duplicate writes
    pub fn duplicates(&self) -> usize {
        self.rules.iter().map(|r| r.duplicates).sum()
    }

    /// Rules whose flush stopped on a store error
    pub fn failed_rules(&self) -> impl Iterator<Item = &RuleFlush> {
        self.rules.iter().filter(|r| r.error.is_some())
    }

    /// Whether every rule flushed without error
    pub fn is_success(&self) -> bool {
        self.failed_rules().next().is_none()
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Moves live accumulator state into durable storage
pub struct Collector {
    registry: Arc<RuleRegistry>,
    accumulator: Arc<LiveAccumulator>,
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
}

impl Collector {
    /// Create a collector over shared state
    pub fn new(
        registry: Arc<RuleRegistry>,
        accumulator: Arc<LiveAccumulator>,
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            accumulator,
            store,
            clock,
        }
    }

    /// Flush the closed buckets of `rules`
    ///
    /// Running it again right away is a no-op: flushed slots no longer exist.
    pub fn process(&self, rules: &[Arc<AggregationRule>]) -> FlushReport {
        self.flush(rules, FlushScope::Closed)
    }

    /// Flush every live bucket of `rules`, open ones included
    pub fn process_all(&self, rules: &[Arc<AggregationRule>]) -> FlushReport {
        self.flush(rules, FlushScope::All)
    }

    /// Flush every registered rule
    pub fn process_registered(&self, scope: FlushScope) -> FlushReport {
        self.flush(&self.registry.all(), scope)
    }

    fn flush(&self, rules: &[Arc<AggregationRule>], scope: FlushScope) -> FlushReport {
        let started = Instant::now();
        let now = self.clock.now();

        // Buckets starting at or after the cutoff are still open
        let cutoffs: HashMap<(&str, &RuleId), Timestamp> = rules
            .iter()
            .map(|rule| {
                let cutoff = match scope {
                    // A clock before the first representable bucket closes nothing
                    FlushScope::Closed => rule
                        .interval()
                        .checked_span_start(now)
                        .unwrap_or(Timestamp::MIN),
                    FlushScope::All => Timestamp::MAX,
                };
                ((rule.project(), rule.id()), cutoff)
            })
            .collect();

        let mut selected: Vec<_> = self
            .accumulator
            .keys_where(|key| {
                cutoffs
                    .get(&(key.project.as_str(), &key.rule_id))
                    .map_or(false, |cutoff| scope == FlushScope::All || key.bucket < *cutoff)
            })
            .into_iter()
            .collect();
        selected.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = FlushReport::default();
        for ((project, rule_id), keys) in selected {
            report
                .rules
                .push(self.flush_rule(RuleFlush::new(project, rule_id), keys, now));
        }

        let elapsed = started.elapsed();
        metrics::record_flushed_buckets("created", report.created());
        metrics::record_flushed_buckets("duplicate", report.duplicates());
        metrics::record_flush(elapsed.as_secs_f64());
        metrics::update_live_slots(self.accumulator.len());

        if !report.rules.is_empty() {
            tracing::debug!(
                ?scope,
                rules = report.rules.len(),
                created = report.created(),
                duplicates = report.duplicates(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Flush pass complete"
            );
        }
        report
    }

    /// Flush one rule's keys in order, stopping at the first store error
    fn flush_rule(&self, mut outcome: RuleFlush, keys: Vec<SlotKey>, now: Timestamp) -> RuleFlush {
        for key in keys {
            // Already taken by a concurrent pass
            let Some(slot) = self.accumulator.take(&key) else {
                continue;
            };

            let bucket = FinalizedBucket {
                key: BucketKey {
                    project: key.project.clone(),
                    rule_id: key.rule_id.clone(),
                    bucket: key.bucket,
                    group: key.group.clone(),
                    generation: slot.generation,
                },
                state: slot.state,
                contributions: slot.contributions,
                flushed_at: now,
            };

            match self.store.write(&bucket) {
                Ok(WriteOutcome::Created) => outcome.created += 1,
                Ok(WriteOutcome::AlreadyExists) => {
                    outcome.duplicates += 1;
                    tracing::debug!(
                        rule_id = %key.rule_id,
                        bucket = key.bucket,
                        generation = bucket.key.generation,
                        "Bucket already stored"
                    );
                },
                Err(e) => {
                    let generation = bucket.key.generation;
                    let slot = LiveSlot {
                        generation,
                        state: bucket.state,
                        contributions: bucket.contributions,
                    };
                    if let Err(merge) = self.accumulator.restore(key.clone(), slot) {
                        tracing::error!(
                            rule_id = %key.rule_id,
                            bucket = key.bucket,
                            error = %merge,
                            "Failed to restore bucket after write error"
                        );
                    } else {
                        outcome.restored += 1;
                    }

                    tracing::error!(
                        project = %outcome.project,
                        rule_id = %outcome.rule_id,
                        bucket = key.bucket,
                        error = %e,
                        "Rule flush failed"
                    );
                    metrics::record_error("storage", "flush");
                    metrics::record_flushed_buckets("failed", 1);
                    outcome.error = Some(e.to_string());
                    break;
                },
            }
        }
        outcome
    }
}

// ============================================================================
// Background Service
// ============================================================================

/// Runs flush passes on a timer
///
/// Every tick flushes closed buckets. On shutdown open buckets are flushed
/// too when `flush_open_buckets_on_shutdown` is set.
pub struct CollectorService {
    collector: Arc<Collector>,
    config: CollectorConfig,
    status: RwLock<ServiceStatus>,
}

impl CollectorService {
    /// Create the service
    pub fn new(collector: Arc<Collector>, config: CollectorConfig) -> Self {
        Self {
            collector,
            config,
            status: RwLock::new(ServiceStatus::Starting),
        }
    }

    async fn run_pass(&self, scope: FlushScope) -> Result<FlushReport, ServiceError> {
        let collector = Arc::clone(&self.collector);
        tokio::task::spawn_blocking(move || collector.process_registered(scope))
            .await
            .map_err(|e| ServiceError::RuntimeError(format!("flush task failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl Service for CollectorService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            interval_ms = self.config.flush_interval_ms,
            "Collector service started"
        );

        let mut flush_interval = interval(self.config.flush_interval());

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Collector service received shutdown signal");
                            break;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Collector service broadcast receiver lagged");
                        }
                    }
                }

                _ = flush_interval.tick() => {
                    match self.run_pass(FlushScope::Closed).await {
                        Ok(report) if !report.is_success() => {
                            tracing::warn!(
                                failed = report.failed_rules().count(),
                                "Flush pass left buckets in memory"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Flush pass failed"),
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopping;
        if self.config.flush_open_buckets_on_shutdown {
            match self.run_pass(FlushScope::All).await {
                Ok(report) => {
                    tracing::info!(created = report.created(), "Flushed open buckets on shutdown");
                },
                Err(e) => {
                    *self.status.write() = ServiceStatus::Failed(e.to_string());
                    return Err(e);
                },
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Collector service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
