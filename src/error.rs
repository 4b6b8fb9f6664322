//! Error types for the checkpoint and backpressure core.
//!
//! Protocol and capacity violations are fatal and raised at the call that
//! detects them. Record failures are not errors here: they are recorded on
//! the owning stream (`StreamManager::mark_processing_failed`) and surface
//! through the stream and destination results.

use crate::catalog::StreamDescriptor;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdkError>;

/// Broad classification of a [`CdkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream contract bug. Terminates the sync, never retried.
    ProtocolViolation,
    /// A reservation that can never be satisfied, or a release that overfills the pool.
    CapacityViolation,
    /// Output delivery failed while forwarding a checkpoint.
    RecordFailure,
    /// Configuration or I/O outside the core.
    Environment,
}

#[derive(Debug, Error)]
pub enum CdkError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("stream {0} is not in the catalog")]
    UnknownStream(StreamDescriptor),

    #[error("cannot reserve {requested} bytes: total capacity is {capacity} bytes")]
    CapacityExceeded { requested: u64, capacity: u64 },

    #[error(
        "releasing {released} bytes with {remaining} remaining exceeds total capacity of {capacity} bytes"
    )]
    ReleaseOverflow {
        released: u64,
        remaining: u64,
        capacity: u64,
    },

    #[error("input consumed but end of stream never marked for: {}", join_streams(.0))]
    StreamsNotEnded(Vec<StreamDescriptor>),

    #[error("cannot mark destination succeeded: streams not succeeded: {}", join_streams(.0))]
    StreamsNotSucceeded(Vec<StreamDescriptor>),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("output consumer failed: {0}")]
    Output(#[source] anyhow::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CdkError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        CdkError::ProtocolViolation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CdkError::ProtocolViolation(_)
            | CdkError::UnknownStream(_)
            | CdkError::StreamsNotEnded(_)
            | CdkError::StreamsNotSucceeded(_) => ErrorKind::ProtocolViolation,
            CdkError::CapacityExceeded { .. } | CdkError::ReleaseOverflow { .. } => {
                ErrorKind::CapacityViolation
            }
            CdkError::Output(_) => ErrorKind::RecordFailure,
            CdkError::Config(_) | CdkError::Io(_) | CdkError::Task(_) => ErrorKind::Environment,
        }
    }

    /// Fatal errors abort the sync. Only environment errors may be worth retrying.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Environment
    }
}

fn join_streams(streams: &[StreamDescriptor]) -> String {
    streams
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_not_ended_names_every_stream() {
        let err = CdkError::StreamsNotEnded(vec![
            StreamDescriptor::new(Some("public"), "users"),
            StreamDescriptor::named("orders"),
        ]);
        let message = err.to_string();
        assert!(message.contains("public.users"));
        assert!(message.contains("orders"));
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            CdkError::CapacityExceeded {
                requested: 10,
                capacity: 5
            }
            .kind(),
            ErrorKind::CapacityViolation
        );
        assert_eq!(
            CdkError::UnknownStream(StreamDescriptor::named("x")).kind(),
            ErrorKind::ProtocolViolation
        );
        assert!(!CdkError::Config("bad".into()).is_fatal());
        assert!(CdkError::Output(anyhow::anyhow!("boom")).is_fatal());
    }
}
