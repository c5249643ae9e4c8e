//! In-memory bucket store

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{fold_generation, BucketStore, FinalizedBucket, GroupStates, WriteOutcome};
use crate::aggregation::state::AccumulatorState;
use crate::error::StorageError;
use crate::rule::RuleId;
use crate::types::{GroupKey, Timestamp};

type RuleBuckets = BTreeMap<(Timestamp, GroupKey, u64), AccumulatorState>;

/// Bucket store backed by process memory
///
/// A write holds the store's write lock for the duration of one insert, so
/// readers observe whole buckets only.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    rules: RwLock<HashMap<(String, RuleId), RuleBuckets>>,
}

impl MemoryBucketStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketStore for MemoryBucketStore {
    fn write(&self, bucket: &FinalizedBucket) -> Result<WriteOutcome, StorageError> {
        let key = &bucket.key;
        let mut rules = self.rules.write();
        let buckets = rules
            .entry((key.project.clone(), key.rule_id.clone()))
            .or_default();

        let slot = (key.bucket, key.group.clone(), key.generation);
        if buckets.contains_key(&slot) {
            return Ok(WriteOutcome::AlreadyExists);
        }
        buckets.insert(slot, bucket.state.clone());
        Ok(WriteOutcome::Created)
    }

    fn read_bucket(
        &self,
        project: &str,
        rule_id: &RuleId,
        bucket: Timestamp,
    ) -> Result<GroupStates, StorageError> {
        let rules = self.rules.read();
        let mut groups = GroupStates::new();
        let Some(buckets) = rules.get(&(project.to_string(), rule_id.clone())) else {
            return Ok(groups);
        };

        // (bucket, "", 0) sorts before every key of the bucket
        let lower = (bucket, GroupKey(String::new()), 0);
        for ((start, group, _), state) in buckets.range(lower..) {
            if *start != bucket {
                break;
            }
            fold_generation(&mut groups, group, state)?;
        }
        Ok(groups)
    }

    fn bucket_count(&self, project: &str, rule_id: &RuleId) -> Result<usize, StorageError> {
        Ok(self
            .rules
            .read()
            .get(&(project.to_string(), rule_id.clone()))
            .map_or(0, |b| b.len()))
    }

    fn max_generation(&self) -> Result<u64, StorageError> {
        Ok(self
            .rules
            .read()
            .values()
            .flat_map(|buckets| buckets.keys().map(|(_, _, generation)| *generation))
            .max()
            .unwrap_or(0))
    }

    fn delete_rule(&self, project: &str, rule_id: &RuleId) -> Result<usize, StorageError> {
        Ok(self
            .rules
            .write()
            .remove(&(project.to_string(), rule_id.clone()))
            .map_or(0, |b| b.len()))
    }

    fn engine_id(&self) -> &str {
        "memory-v1"
    }
}
