//! Checkpoint identities, per-checkpoint counters and batch durability states.

use crate::state::range_set::RangeSet;
use std::fmt;
use std::ops::{Add, AddAssign, Range};

/// Upstream-minted checkpoint boundary, unique within a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub fn next(self) -> Self {
        CheckpointId(self.0 + 1)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counters reported for one (checkpoint, state). Merged additively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointValue {
    pub records: u64,
    pub serialized_bytes: u64,
    pub rejected_records: u64,
}

impl CheckpointValue {
    pub fn new(records: u64, serialized_bytes: u64) -> Self {
        Self {
            records,
            serialized_bytes,
            rejected_records: 0,
        }
    }

    pub fn with_rejected(mut self, rejected_records: u64) -> Self {
        self.rejected_records = rejected_records;
        self
    }

    /// Records accounted for: written plus rejected.
    pub fn accounted_records(&self) -> u64 {
        self.records.saturating_add(self.rejected_records)
    }
}

impl Add for CheckpointValue {
    type Output = CheckpointValue;

    fn add(self, other: CheckpointValue) -> CheckpointValue {
        CheckpointValue {
            records: self.records.saturating_add(other.records),
            serialized_bytes: self.serialized_bytes.saturating_add(other.serialized_bytes),
            rejected_records: self.rejected_records.saturating_add(other.rejected_records),
        }
    }
}

impl AddAssign for CheckpointValue {
    fn add_assign(&mut self, other: CheckpointValue) {
        *self = *self + other;
    }
}

/// Durability stage reached by a batch. Later stages imply the earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchState {
    /// Records processed in memory.
    Processed,
    /// Staged locally, not yet durable.
    Staged,
    /// Durable at the destination; checkpoints covering it may be released.
    Persisted,
    /// Fully written and finalized.
    Complete,
}

impl BatchState {
    pub const ALL: [BatchState; 4] = [
        BatchState::Processed,
        BatchState::Staged,
        BatchState::Persisted,
        BatchState::Complete,
    ];

    pub fn is_persisted(self) -> bool {
        self >= BatchState::Persisted
    }
}

/// A batch-state transition for a set of record-index ranges of one stream.
#[derive(Debug, Clone)]
pub struct BatchEnvelope {
    pub state: BatchState,
    pub ranges: RangeSet,
    /// Batches sharing a group id share the max state reported for the group.
    pub group_id: Option<String>,
}

impl BatchEnvelope {
    pub fn new(state: BatchState, ranges: RangeSet) -> Self {
        Self {
            state,
            ranges,
            group_id: None,
        }
    }

    /// Envelope for a single half-open range of record indexes.
    pub fn for_range(state: BatchState, range: Range<u64>) -> Self {
        let mut ranges = RangeSet::new();
        ranges.insert(range);
        Self::new(state, ranges)
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_value_merges_additively() {
        let mut value = CheckpointValue::new(5, 100);
        value += CheckpointValue::new(3, 40).with_rejected(2);
        assert_eq!(value.records, 8);
        assert_eq!(value.serialized_bytes, 140);
        assert_eq!(value.rejected_records, 2);
        assert_eq!(value.accounted_records(), 10);
    }

    #[test]
    fn test_checkpoint_value_saturates() {
        let mut value = CheckpointValue::new(u64::MAX - 1, u64::MAX).with_rejected(5);
        value += CheckpointValue::new(10, 1).with_rejected(u64::MAX);
        assert_eq!(value.records, u64::MAX);
        assert_eq!(value.serialized_bytes, u64::MAX);
        assert_eq!(value.rejected_records, u64::MAX);
        assert_eq!(value.accounted_records(), u64::MAX);
    }

    #[test]
    fn test_batch_state_order() {
        assert!(BatchState::Persisted < BatchState::Complete);
        assert!(BatchState::Complete.is_persisted());
        assert!(!BatchState::Staged.is_persisted());
    }
}
