//! Query-time rollup over finalized buckets
//!
//! A query asks for the `frame` most recent buckets of a query interval,
//! which must be an integer multiple of the rule's native interval. Every
//! query bucket is assembled from the native buckets it spans, folding each
//! group's states with the aggregation's merge law, then rendered for the
//! requested analysis.
//!
//! ```text
//! native (1day):  | d0 | d1 | d2 | d3 | d4 | d5 |
//! query  (2day):  |  f0     |  f1     |  f2     |   frame = 3, oldest first
//! ```
//!
//! Missing native buckets contribute nothing. Only finalized state is read;
//! live accumulator slots become visible once the collector flushes them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::state::AggregateValue;
use crate::clock::Clock;
use crate::error::{Error, Result, ValidationError};
use crate::interval::{format_label, Interval, SpanCursor};
use crate::metastore::Metastore;
use crate::metrics;
use crate::rule::{AnalysisType, RuleId, RuleRegistry};
use crate::storage::{fold_generation, BucketStore, GroupStates};
use crate::types::{ProjectId, Timestamp};

/// Upper bound on native buckets read by one query
pub const MAX_NATIVE_BUCKETS: usize = 1_000_000;

/// A rollup query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Project owning the rule
    pub project: ProjectId,
    /// Rule to read
    pub rule_id: RuleId,
    /// How to render the state; the rule's natural analysis when absent
    #[serde(default)]
    pub analysis: Option<AnalysisType>,
    /// Query bucket width; the rule's interval when absent
    #[serde(default)]
    pub interval: Option<Interval>,
    /// Number of buckets to return; the analyzer's default when absent
    #[serde(default)]
    pub frame: Option<usize>,
    /// Anchor of the newest bucket; now when absent
    #[serde(default)]
    pub until: Option<Timestamp>,
}

impl QueryRequest {
    /// Query a rule with every option at its default
    pub fn new(project: impl Into<ProjectId>, rule_id: RuleId) -> Self {
        Self {
            project: project.into(),
            rule_id,
            analysis: None,
            interval: None,
            frame: None,
            until: None,
        }
    }

    /// Render with `analysis`
    pub fn analysis(mut self, analysis: AnalysisType) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// Roll up into buckets of `interval`
    pub fn interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Return `frame` buckets
    pub fn frame(mut self, frame: usize) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Anchor the newest bucket at `until` instead of now
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }
}

/// One output bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Bucket start
    pub timestamp: Timestamp,
    /// Bucket start as RFC 3339
    pub label: String,
    /// Rendered value per group key; groups with no data are absent
    pub groups: BTreeMap<String, AggregateValue>,
}

impl Frame {
    /// Value of one group
    pub fn group(&self, key: &str) -> Option<&AggregateValue> {
        self.groups.get(key)
    }
}

/// Query answer, frames oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rule that was read
    pub rule_id: RuleId,
    /// Analysis that was rendered
    pub analysis: AnalysisType,
    /// Width of each frame
    pub interval: Interval,
    /// Output buckets
    pub frames: Vec<Frame>,
}

impl QueryResult {
    /// JSON encoding of the result
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Answers rollup queries from the bucket store
pub struct EventAnalyzer {
    registry: Arc<RuleRegistry>,
    store: Arc<dyn BucketStore>,
    metastore: Arc<dyn Metastore>,
    clock: Arc<dyn Clock>,
    max_frames: usize,
    default_frame: usize,
}

impl EventAnalyzer {
    /// Create an analyzer with frame limits of 1000 (max) and 10 (default)
    pub fn new(
        registry: Arc<RuleRegistry>,
        store: Arc<dyn BucketStore>,
        metastore: Arc<dyn Metastore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            metastore,
            clock,
            max_frames: 1000,
            default_frame: 10,
        }
    }

    /// Override the frame limits
    pub fn with_frame_limits(mut self, max_frames: usize, default_frame: usize) -> Self {
        self.max_frames = max_frames;
        self.default_frame = default_frame;
        self
    }

    /// Run a query
    pub fn analyze(&self, request: &QueryRequest) -> Result<QueryResult> {
        let started = Instant::now();
        match self.run(request) {
            Ok(result) => {
                metrics::record_query(result.analysis.as_str(), started.elapsed().as_secs_f64());
                tracing::debug!(
                    project = %request.project,
                    rule_id = %result.rule_id,
                    analysis = %result.analysis,
                    interval = %result.interval,
                    frames = result.frames.len(),
                    "Query answered"
                );
                Ok(result)
            },
            Err(e) => {
                metrics::record_error(e.kind(), "query");
                Err(e)
            },
        }
    }

    fn run(&self, request: &QueryRequest) -> Result<QueryResult> {
        let project = request.project.as_str();
        if !self.metastore.project_exists(project) {
            return Err(Error::ProjectNotFound(request.project.clone()));
        }
        let rule = self
            .registry
            .rule(project, &request.rule_id)
            .ok_or_else(|| Error::RuleNotFound {
                project: request.project.clone(),
                rule: request.rule_id.to_string(),
            })?;

        // Validate everything before touching storage
        let aggregation = rule.aggregation();
        let analysis = request
            .analysis
            .unwrap_or_else(|| aggregation.natural_analysis());
        if !aggregation.supports(analysis) {
            return Err(ValidationError::UnsupportedAnalysis {
                aggregation: aggregation.to_string(),
                analysis: analysis.to_string(),
            }
            .into());
        }

        let native = rule.interval();
        let query_interval = request.interval.unwrap_or(native);
        let per_frame = native.fine_buckets_per(&query_interval).ok_or_else(|| {
            ValidationError::IncompatibleInterval {
                query: query_interval.to_string(),
                native: native.to_string(),
            }
        })?;

        let frame = request.frame.unwrap_or(self.default_frame);
        if frame == 0 || frame > self.max_frames {
            return Err(ValidationError::InvalidFrame {
                frame,
                max: self.max_frames,
            }
            .into());
        }
        let native_total = frame.saturating_mul(per_frame);
        if native_total > MAX_NATIVE_BUCKETS {
            return Err(ValidationError::OutOfRange {
                field: "native buckets per query".to_string(),
                value: native_total.to_string(),
                min: "1".to_string(),
                max: MAX_NATIVE_BUCKETS.to_string(),
            }
            .into());
        }

        let anchor = request.until.unwrap_or_else(|| self.clock.now());
        let window = frame_window(native, query_interval, anchor, frame, per_frame)
            .ok_or_else(|| ValidationError::OutOfRange {
                field: "until".to_string(),
                value: anchor.to_string(),
                min: i64::MIN.to_string(),
                max: i64::MAX.to_string(),
            })?;

        let mut frames = Vec::with_capacity(frame);
        for (cursor, starts) in window {

            let mut combined = GroupStates::new();
            for groups in self
                .store
                .read_buckets(project, rule.id(), &starts)?
                .values()
            {
                for (group, state) in groups {
                    fold_generation(&mut combined, group, state)?;
                }
            }

            frames.push(Frame {
                timestamp: cursor.current(),
                label: format_label(cursor.current()),
                groups: combined
                    .into_iter()
                    .filter_map(|(group, state)| state.render(analysis).map(|v| (group.0, v)))
                    .collect(),
            });
        }

        Ok(QueryResult {
            rule_id: rule.id().clone(),
            analysis,
            interval: query_interval,
            frames,
        })
    }
}

/// Frame cursors, oldest first, each with the native bucket starts it
/// covers; `None` when any of those starts falls outside the timestamp range
fn frame_window(
    native: Interval,
    query_interval: Interval,
    anchor: Timestamp,
    frame: usize,
    per_frame: usize,
) -> Option<Vec<(SpanCursor, Vec<Timestamp>)>> {
    let newest = query_interval.checked_span(native.checked_span_start(anchor)?)?;
    let oldest = newest.checked_shift(-(i64::try_from(frame).ok()? - 1))?;

    (0..frame)
        .map(|offset| {
            let cursor = oldest.checked_shift(offset as i64)?;
            let starts = (0..per_frame)
                .map(|i| {
                    (i as i64)
                        .checked_mul(native.width())
                        .and_then(|step| cursor.current().checked_add(step))
                })
                .collect::<Option<Vec<_>>>()?;
            Some((cursor, starts))
        })
        .collect()
}
