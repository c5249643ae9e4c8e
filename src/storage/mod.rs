//! Finalized bucket storage
//!
//! The collector moves accumulator state out of live memory into a
//! [`BucketStore`]; the analyzer reads it back. A finalized bucket is keyed by
//! `(project, rule, bucket start, group, generation)` and is written once. Writing a
//! key that already exists is a no-op reported as
//! [`WriteOutcome::AlreadyExists`], which makes re-running a flush harmless.
//!
//! The same (rule, bucket, group) can hold several generations when events
//! arrive for a bucket after it was flushed. Reads fold all generations with
//! the aggregation type's merge law, so readers always see one state per
//! group.
//!
//! ```text
//! LiveAccumulator ──take──▶ FinalizedBucket ──write──▶ BucketStore
//!                                                         │
//! EventAnalyzer ◀──── fold generations per group ◀──read──┘
//! ```
//!
//! # Backends
//!
//! - [`MemoryBucketStore`]: in-process, for tests and ephemeral deployments
//! - [`LocalDiskBucketStore`]: one JSON file per finalized bucket

pub mod local_disk;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregation::state::AccumulatorState;
use crate::error::StorageError;
use crate::rule::RuleId;
use crate::types::{GroupKey, ProjectId, Timestamp};

pub use local_disk::LocalDiskBucketStore;
pub use memory::MemoryBucketStore;

/// Identity of a finalized bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Project owning the rule
    pub project: ProjectId,
    /// Rule that produced the bucket
    pub rule_id: RuleId,
    /// Native bucket start
    pub bucket: Timestamp,
    /// Group within the bucket
    pub group: GroupKey,
    /// Flush generation
    pub generation: u64,
}

/// Accumulator state moved out of live memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedBucket {
    /// Bucket identity
    pub key: BucketKey,
    /// Accumulated state
    pub state: AccumulatorState,
    /// Number of events folded into the state
    pub contributions: u64,
    /// When the bucket was flushed
    pub flushed_at: Timestamp,
}

/// Result of a bucket write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The bucket was stored
    Created,
    /// A bucket with the same key was already stored; nothing changed
    AlreadyExists,
}

/// States of one native bucket, one per group
pub type GroupStates = BTreeMap<GroupKey, AccumulatorState>;

/// Persistent store of finalized buckets
///
/// Writes must be atomic per bucket: a concurrent reader sees either the
/// whole bucket or none of it.
pub trait BucketStore: Send + Sync {
    /// Store a bucket unless its key is already present
    fn write(&self, bucket: &FinalizedBucket) -> Result<WriteOutcome, StorageError>;

    /// All groups of one native bucket, generations folded
    fn read_bucket(
        &self,
        project: &str,
        rule_id: &RuleId,
        bucket: Timestamp,
    ) -> Result<GroupStates, StorageError>;

    /// One group of one native bucket, generations folded; `None` when
    /// nothing was stored for it
    fn read_group(
        &self,
        project: &str,
        rule_id: &RuleId,
        bucket: Timestamp,
        group: &GroupKey,
    ) -> Result<Option<AccumulatorState>, StorageError> {
        Ok(self.read_bucket(project, rule_id, bucket)?.remove(group))
    }

    /// Groups of several native buckets; buckets with no data are omitted
    fn read_buckets(
        &self,
        project: &str,
        rule_id: &RuleId,
        buckets: &[Timestamp],
    ) -> Result<BTreeMap<Timestamp, GroupStates>, StorageError> {
        let mut out = BTreeMap::new();
        for &bucket in buckets {
            let groups = self.read_bucket(project, rule_id, bucket)?;
            if !groups.is_empty() {
                out.insert(bucket, groups);
            }
        }
        Ok(out)
    }

    /// Number of stored finalized buckets (all generations) for a rule
    fn bucket_count(&self, project: &str, rule_id: &RuleId) -> Result<usize, StorageError>;

    /// Highest generation stored, 0 when empty
    fn max_generation(&self) -> Result<u64, StorageError>;

    /// Remove everything stored for a rule, returning how many buckets went
    fn delete_rule(&self, project: &str, rule_id: &RuleId) -> Result<usize, StorageError>;

    /// Backend identifier
    fn engine_id(&self) -> &str;
}

/// Fold one stored generation into a per-group map
pub(crate) fn fold_generation(
    groups: &mut GroupStates,
    group: &GroupKey,
    state: &AccumulatorState,
) -> Result<(), StorageError> {
    match groups.get_mut(group) {
        Some(existing) => existing.merge(state).map_err(|e| {
            StorageError::CorruptedBucket(format!("group '{}': {}", group, e))
        }),
        None => {
            groups.insert(group.clone(), state.clone());
            Ok(())
        },
    }
}
