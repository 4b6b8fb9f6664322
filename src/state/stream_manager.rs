//! Per-stream progress and lifecycle.
//!
//! A stream moves `Active -> EndOfStreamReached -> ProcessingSucceeded`, or
//! to `ProcessingFailed` from either non-terminal state. Progress is tracked
//! two ways:
//!
//! - by record-index ranges per [`BatchState`] (used for checkpoint release)
//! - by per-checkpoint counters (used for checkpoint-id based accounting)

use crate::catalog::StreamDescriptor;
use crate::error::{CdkError, Result};
use crate::state::checkpoint::{BatchEnvelope, BatchState, CheckpointId, CheckpointValue};
use crate::state::range_set::RangeSet;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Terminal result of a stream.
#[derive(Debug, Clone)]
pub enum StreamResult {
    Succeeded,
    Failed(Arc<anyhow::Error>),
}

impl StreamResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamResult::Succeeded)
    }
}

#[derive(Default)]
struct StreamState {
    read_count: u64,
    had_reads: bool,
    end_of_stream: bool,
    received_complete: bool,

    current_checkpoint_id: CheckpointId,
    last_checkpoint_index: u64,
    reads_by_checkpoint: BTreeMap<CheckpointId, u64>,
    counts: HashMap<(CheckpointId, BatchState), CheckpointValue>,

    // Ranges at or beyond each state; a Complete range is also filed under Persisted etc.
    ranges: HashMap<BatchState, RangeSet>,
    groups: HashMap<String, (BatchState, RangeSet)>,
}

impl StreamState {
    fn covered(&self, state: BatchState, end: u64) -> bool {
        match self.ranges.get(&state) {
            Some(ranges) => ranges.covers_prefix(end),
            None => end == 0,
        }
    }

    fn checkpoint_satisfied(&self, id: CheckpointId, at_least: BatchState) -> bool {
        let read = self.reads_by_checkpoint.get(&id).copied().unwrap_or(0);
        BatchState::ALL
            .iter()
            .filter(|state| **state >= at_least)
            .any(|state| {
                let accounted = self
                    .counts
                    .get(&(id, *state))
                    .map_or(0, CheckpointValue::accounted_records);
                accounted >= read
            })
    }
}

pub struct StreamManager {
    stream: StreamDescriptor,
    state: Mutex<StreamState>,
    result: watch::Sender<Option<StreamResult>>,
}

impl StreamManager {
    pub fn new(stream: StreamDescriptor) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            stream,
            state: Mutex::new(StreamState::default()),
            result,
        }
    }

    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Reads and checkpoint minting
    // =========================================================================

    /// Count one record read, attributed to the current checkpoint.
    /// Returns the running total.
    pub fn increment_read_count(&self) -> Result<u64> {
        let mut state = self.state();
        let id = state.current_checkpoint_id;
        self.count_read(&mut state, id)
    }

    /// Count one record read, attributed to `checkpoint_id`.
    /// Returns the running total.
    pub fn increment_read_count_for(&self, checkpoint_id: CheckpointId) -> Result<u64> {
        let mut state = self.state();
        self.count_read(&mut state, checkpoint_id)
    }

    fn count_read(&self, state: &mut StreamState, checkpoint_id: CheckpointId) -> Result<u64> {
        if state.end_of_stream {
            return Err(CdkError::protocol(format!(
                "record read for stream {} after end of stream",
                self.stream
            )));
        }
        state.read_count += 1;
        state.had_reads = true;
        *state.reads_by_checkpoint.entry(checkpoint_id).or_insert(0) += 1;
        Ok(state.read_count)
    }

    pub fn read_count(&self) -> u64 {
        self.state().read_count
    }

    /// Records read under `checkpoint_id`.
    pub fn read_count_for(&self, checkpoint_id: CheckpointId) -> u64 {
        self.state()
            .reads_by_checkpoint
            .get(&checkpoint_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn had_nonzero_records(&self) -> bool {
        self.state().had_reads
    }

    pub fn current_checkpoint_id(&self) -> CheckpointId {
        self.state().current_checkpoint_id
    }

    /// Close the current checkpoint and advance the id.
    ///
    /// Returns `(index, count)`: the running read total at the boundary and
    /// the number of records read since the previous boundary.
    pub fn mark_checkpoint(&self) -> (u64, u64) {
        let mut state = self.state();
        let index = state.read_count;
        let count = index - state.last_checkpoint_index;
        state.last_checkpoint_index = index;
        state.current_checkpoint_id = state.current_checkpoint_id.next();
        (index, count)
    }

    // =========================================================================
    // End of stream
    // =========================================================================

    /// Mark that the source has no more records for this stream. Returns the
    /// final read count. Callable exactly once.
    pub fn mark_end_of_stream(&self, received_stream_complete: bool) -> Result<u64> {
        let mut state = self.state();
        if state.end_of_stream {
            return Err(CdkError::protocol(format!(
                "end of stream already marked for stream {}",
                self.stream
            )));
        }
        state.end_of_stream = true;
        state.received_complete = received_stream_complete;
        tracing::info!(
            "End of stream for {} after {} records (complete: {})",
            self.stream,
            state.read_count,
            received_stream_complete
        );
        Ok(state.read_count)
    }

    pub fn end_of_stream_read(&self) -> bool {
        self.state().end_of_stream
    }

    /// Whether the source reported the stream as complete at end of stream.
    pub fn is_complete(&self) -> bool {
        self.state().received_complete
    }

    // =========================================================================
    // Range-based batch state
    // =========================================================================

    pub fn update_batch_state(&self, envelope: BatchEnvelope) {
        let mut state = self.state();
        let (batch_state, ranges) = match envelope.group_id {
            Some(group_id) => {
                let group = state
                    .groups
                    .entry(group_id)
                    .or_insert_with(|| (envelope.state, RangeSet::new()));
                group.0 = group.0.max(envelope.state);
                group.1.extend(&envelope.ranges);
                (group.0, group.1.clone())
            }
            None => (envelope.state, envelope.ranges),
        };

        for implied in BatchState::ALL.iter().filter(|s| **s <= batch_state) {
            state.ranges.entry(*implied).or_default().extend(&ranges);
        }
    }

    /// True if records `[0, index)` are persisted (or complete).
    pub fn are_records_persisted_until(&self, index: u64) -> bool {
        self.state().covered(BatchState::Persisted, index)
    }

    /// True once end of stream is reached and every record read is complete.
    pub fn is_batch_processing_complete(&self) -> bool {
        let state = self.state();
        state.end_of_stream && state.covered(BatchState::Complete, state.read_count)
    }

    // =========================================================================
    // Checkpoint-count batch state
    // =========================================================================

    /// Merge counters reported by writers. Repeated reports for the same
    /// (checkpoint, state) accumulate.
    pub fn increment_checkpoint_counts<I>(&self, batch_state: BatchState, counts: I)
    where
        I: IntoIterator<Item = (CheckpointId, CheckpointValue)>,
    {
        let mut state = self.state();
        for (id, value) in counts {
            *state.counts.entry((id, batch_state)).or_default() += value;
        }
    }

    pub fn increment_persisted_count(&self, checkpoint_id: CheckpointId, records: u64) {
        self.increment_checkpoint_counts(
            BatchState::Persisted,
            [(checkpoint_id, CheckpointValue::new(records, 0))],
        );
    }

    pub fn increment_completed_count(&self, checkpoint_id: CheckpointId, records: u64) {
        self.increment_checkpoint_counts(
            BatchState::Complete,
            [(checkpoint_id, CheckpointValue::new(records, 0))],
        );
    }

    /// True if persisted-or-better records plus rejected records account for
    /// every record read under `checkpoint_id`.
    pub fn are_records_persisted_for_checkpoint(&self, checkpoint_id: CheckpointId) -> bool {
        self.state()
            .checkpoint_satisfied(checkpoint_id, BatchState::Persisted)
    }

    /// True if every checkpoint up to and including `checkpoint_id` is persisted.
    pub fn are_records_persisted_until_checkpoint(&self, checkpoint_id: CheckpointId) -> bool {
        let state = self.state();
        state
            .reads_by_checkpoint
            .range(..=checkpoint_id)
            .all(|(id, _)| state.checkpoint_satisfied(*id, BatchState::Persisted))
    }

    /// The richest single observation reported for `checkpoint_id` across
    /// states: the max, not the sum.
    pub fn committed_count(&self, checkpoint_id: CheckpointId) -> Option<CheckpointValue> {
        let state = self.state();
        BatchState::ALL
            .iter()
            .filter_map(|s| state.counts.get(&(checkpoint_id, *s)))
            .max_by_key(|value| (value.records, value.serialized_bytes))
            .copied()
    }

    /// True once end of stream is reached and every checkpoint with reads is
    /// complete, in whichever order those signals arrived.
    pub fn is_batch_processing_complete_for_checkpoints(&self) -> bool {
        let state = self.state();
        state.end_of_stream
            && state
                .reads_by_checkpoint
                .keys()
                .all(|id| state.checkpoint_satisfied(*id, BatchState::Complete))
    }

    // =========================================================================
    // Terminal result
    // =========================================================================

    pub fn mark_processing_succeeded(&self) -> Result<()> {
        if !self.state().end_of_stream {
            return Err(CdkError::protocol(format!(
                "stream {} marked succeeded before end of stream",
                self.stream
            )));
        }
        if !self.publish(StreamResult::Succeeded) {
            tracing::debug!("Stream {} already has a result", self.stream);
        }
        Ok(())
    }

    /// Record a failure. Legal in any state. Returns false if a result was
    /// already published.
    pub fn mark_processing_failed(&self, cause: anyhow::Error) -> bool {
        tracing::warn!("Stream {} failed: {:#}", self.stream, cause);
        self.publish(StreamResult::Failed(Arc::new(cause)))
    }

    fn publish(&self, result: StreamResult) -> bool {
        self.result.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        })
    }

    /// Non-blocking poll of the terminal result.
    pub fn stream_result(&self) -> Option<StreamResult> {
        self.result.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.result.borrow().is_none()
    }

    /// Wait until a terminal result is published.
    pub async fn await_stream_result(&self) -> StreamResult {
        let mut rx = self.result.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return StreamResult::Failed(Arc::new(anyhow::anyhow!(
                    "result channel for stream {} closed",
                    self.stream
                )));
            }
        }
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("stream", &self.stream)
            .field("read_count", &self.read_count())
            .field("result", &self.stream_result())
            .finish()
    }
}
