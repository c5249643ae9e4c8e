//! Live accumulator
//!
//! Holds the not-yet-flushed state of every (rule, bucket, group) slot in a
//! sharded map. Updates lock only the slot's shard, so events for different
//! slots proceed in parallel and each update is atomic with respect to a
//! concurrent flush of the same slot.
//!
//! The collector drains a slot with [`LiveAccumulator::take`], which removes
//! it in one step: an update either lands in the removed state or creates a
//! fresh slot. Every slot is stamped with a generation number when it is
//! created, so a fresh slot for an already flushed bucket is persisted as a
//! separate generation instead of overwriting the earlier one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::state::{AccumulatorState, Contribution};
use crate::error::MergeError;
use crate::rule::{AggregationType, RuleId};
use crate::types::{GroupKey, ProjectId, Timestamp};

/// Identity of a live slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Project owning the rule
    pub project: ProjectId,
    /// Rule the slot belongs to
    pub rule_id: RuleId,
    /// Native bucket start
    pub bucket: Timestamp,
    /// Group within the bucket
    pub group: GroupKey,
}

/// State of one live slot
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSlot {
    /// Generation assigned when the slot was created
    pub generation: u64,
    /// Accumulated state
    pub state: AccumulatorState,
    /// Number of contributions folded in
    pub contributions: u64,
}

/// Sharded map of live slots
#[derive(Debug)]
pub struct LiveAccumulator {
    slots: DashMap<SlotKey, LiveSlot>,
    next_generation: AtomicU64,
    unique_precision: u8,
}

impl LiveAccumulator {
    /// Create an empty accumulator; `unique_precision` sizes UNIQUE_X sketches
    pub fn new(unique_precision: u8) -> Self {
        Self {
            slots: DashMap::new(),
            next_generation: AtomicU64::new(1),
            unique_precision,
        }
    }

    /// Continue generation numbering after `generation`
    ///
    /// Used when a persistent store already holds buckets from an earlier
    /// run, so new generations never collide with stored ones.
    pub fn resume_after(&self, generation: u64) {
        self.next_generation
            .fetch_max(generation.saturating_add(1), Ordering::SeqCst);
    }

    fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Fold a contribution into the slot, creating it on first use
    pub fn apply(
        &self,
        key: SlotKey,
        aggregation: AggregationType,
        contribution: &Contribution,
    ) -> Result<(), MergeError> {
        let mut slot = self.slots.entry(key).or_insert_with(|| LiveSlot {
            generation: self.allocate_generation(),
            state: AccumulatorState::empty(aggregation, self.unique_precision),
            contributions: 0,
        });
        slot.state.apply(contribution)?;
        slot.contributions += 1;
        Ok(())
    }

    /// Remove a slot for flushing
    pub fn take(&self, key: &SlotKey) -> Option<LiveSlot> {
        self.slots.remove(key).map(|(_, slot)| slot)
    }

    /// Put back a slot whose flush failed
    ///
    /// If events created a fresh slot in the meantime, the returned state is
    /// merged into it, so no contribution is lost either way.
    pub fn restore(&self, key: SlotKey, slot: LiveSlot) -> Result<(), MergeError> {
        match self.slots.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
            },
            Entry::Occupied(mut occupied) => {
                let live = occupied.get_mut();
                live.state.merge(&slot.state)?;
                live.contributions += slot.contributions;
            },
        }
        Ok(())
    }

    /// Keys of slots selected by `pick`, grouped by (project, rule) and sorted
    pub fn keys_where(
        &self,
        mut pick: impl FnMut(&SlotKey) -> bool,
    ) -> HashMap<(ProjectId, RuleId), Vec<SlotKey>> {
        let mut selected: HashMap<(ProjectId, RuleId), Vec<SlotKey>> = HashMap::new();
        for entry in self.slots.iter() {
            let key = entry.key();
            if pick(key) {
                selected
                    .entry((key.project.clone(), key.rule_id.clone()))
                    .or_default()
                    .push(key.clone());
            }
        }
        for keys in selected.values_mut() {
            keys.sort();
        }
        selected
    }

    /// Copy of a slot's current state
    pub fn snapshot(&self, key: &SlotKey) -> Option<LiveSlot> {
        self.slots.get(key).map(|slot| slot.value().clone())
    }

    /// Drop every slot of a rule, returning how many were dropped
    pub fn discard_rule(&self, project: &str, rule_id: &RuleId) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|key, _| !(key.project == project && &key.rule_id == rule_id));
        before.saturating_sub(self.slots.len())
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no live slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
