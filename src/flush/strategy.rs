//! Size and count based flush policies.
//!
//! Writers consult a [`FlushStrategy`] after buffering data for a stream to
//! decide whether to flush proactively. Policies are stateless.

use crate::catalog::StreamDescriptor;
use std::ops::Range;

pub trait FlushStrategy: Send + Sync {
    /// `range` is the buffered record-index range and `data_length_bytes`
    /// the bytes accumulated for it.
    fn should_flush(
        &self,
        stream: &StreamDescriptor,
        range: &Range<u64>,
        data_length_bytes: u64,
    ) -> bool;
}

/// Flush once the buffered bytes reach the configured batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultFlushStrategy {
    record_batch_size_bytes: u64,
}

impl DefaultFlushStrategy {
    pub fn new(record_batch_size_bytes: u64) -> Self {
        Self {
            record_batch_size_bytes,
        }
    }

    pub fn record_batch_size_bytes(&self) -> u64 {
        self.record_batch_size_bytes
    }
}

impl FlushStrategy for DefaultFlushStrategy {
    fn should_flush(
        &self,
        _stream: &StreamDescriptor,
        _range: &Range<u64>,
        data_length_bytes: u64,
    ) -> bool {
        data_length_bytes >= self.record_batch_size_bytes
    }
}

/// Flush once the buffered range spans `max_records` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCountFlushStrategy {
    max_records: u64,
}

impl RecordCountFlushStrategy {
    pub fn new(max_records: u64) -> Self {
        Self { max_records }
    }
}

impl FlushStrategy for RecordCountFlushStrategy {
    fn should_flush(
        &self,
        _stream: &StreamDescriptor,
        range: &Range<u64>,
        _data_length_bytes: u64,
    ) -> bool {
        range.end.saturating_sub(range.start) >= self.max_records
    }
}
