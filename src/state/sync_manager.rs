//! Sync-level registry and aggregation.
//!
//! Owns one [`StreamManager`] per catalog stream for the lifetime of a sync
//! and folds their terminal results into a single [`DestinationResult`].

use crate::catalog::{DestinationCatalog, StreamDescriptor};
use crate::error::{CdkError, Result};
use crate::state::checkpoint::{BatchEnvelope, BatchState};
use crate::state::stream_manager::{StreamManager, StreamResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::watch;

/// Final outcome of the destination.
#[derive(Debug, Clone)]
pub enum DestinationResult {
    Success,
    Failure {
        cause: Arc<anyhow::Error>,
        failed_streams: Vec<StreamDescriptor>,
    },
}

impl DestinationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DestinationResult::Success)
    }
}

pub struct SyncManager {
    catalog: DestinationCatalog,
    stream_managers: HashMap<StreamDescriptor, Arc<StreamManager>>,
    input_consumed: watch::Sender<bool>,
    destination_result: watch::Sender<Option<DestinationResult>>,
}

impl SyncManager {
    pub fn new(catalog: DestinationCatalog) -> Self {
        let stream_managers = catalog
            .streams
            .iter()
            .map(|stream| (stream.clone(), Arc::new(StreamManager::new(stream.clone()))))
            .collect();
        let (input_consumed, _) = watch::channel(false);
        let (destination_result, _) = watch::channel(None);
        Self {
            catalog,
            stream_managers,
            input_consumed,
            destination_result,
        }
    }

    pub fn catalog(&self) -> &DestinationCatalog {
        &self.catalog
    }

    /// The manager for a catalog stream. Never creates one for an unknown stream.
    pub fn get_stream_manager(&self, stream: &StreamDescriptor) -> Result<Arc<StreamManager>> {
        self.stream_managers
            .get(stream)
            .cloned()
            .ok_or_else(|| CdkError::UnknownStream(stream.clone()))
    }

    /// Stream managers in catalog order.
    pub fn stream_managers(&self) -> impl Iterator<Item = &Arc<StreamManager>> + '_ {
        self.catalog
            .streams
            .iter()
            .filter_map(|stream| self.stream_managers.get(stream))
    }

    /// Report `range` of `stream`'s record indexes as persisted.
    pub fn mark_persisted(&self, stream: &StreamDescriptor, range: Range<u64>) -> Result<()> {
        self.get_stream_manager(stream)?
            .update_batch_state(BatchEnvelope::for_range(BatchState::Persisted, range));
        Ok(())
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Called once the source is fully read. Every stream must have seen end of stream.
    pub fn mark_input_consumed(&self) -> Result<()> {
        let not_ended: Vec<StreamDescriptor> = self
            .stream_managers()
            .filter(|manager| !manager.end_of_stream_read())
            .map(|manager| manager.stream().clone())
            .collect();
        if !not_ended.is_empty() {
            return Err(CdkError::StreamsNotEnded(not_ended));
        }
        self.input_consumed.send_replace(true);
        tracing::info!("Input consumed for {} streams", self.catalog.len());
        Ok(())
    }

    pub fn is_input_consumed(&self) -> bool {
        *self.input_consumed.borrow()
    }

    pub async fn await_input_consumed(&self) {
        let mut rx = self.input_consumed.subscribe();
        // Err only if the sender is dropped, which `self` prevents.
        let _ = rx.wait_for(|consumed| *consumed).await;
    }

    // =========================================================================
    // Stream aggregation
    // =========================================================================

    /// Wait until every stream has a terminal result. Returns false as soon
    /// as any stream fails, without waiting for the rest.
    pub async fn await_all_streams_processed_successfully(&self) -> bool {
        let mut results: FuturesUnordered<_> = self
            .stream_managers()
            .map(|manager| manager.await_stream_result())
            .collect();
        while let Some(result) = results.next().await {
            if !result.is_success() {
                return false;
            }
        }
        true
    }

    /// Non-blocking: true if every stream has a terminal result.
    pub fn all_streams_terminal(&self) -> bool {
        self.stream_managers().all(|manager| !manager.is_active())
    }

    fn failed_streams(&self) -> Vec<(StreamDescriptor, Arc<anyhow::Error>)> {
        self.stream_managers()
            .filter_map(|manager| match manager.stream_result() {
                Some(StreamResult::Failed(cause)) => Some((manager.stream().clone(), cause)),
                _ => None,
            })
            .collect()
    }

    // =========================================================================
    // Destination result
    // =========================================================================

    /// True until the destination result is explicitly set, even when every
    /// stream has individually finished.
    pub fn is_active(&self) -> bool {
        self.destination_result.borrow().is_none()
    }

    pub fn mark_destination_succeeded(&self) -> Result<()> {
        let not_succeeded: Vec<StreamDescriptor> = self
            .stream_managers()
            .filter(|manager| !matches!(manager.stream_result(), Some(StreamResult::Succeeded)))
            .map(|manager| manager.stream().clone())
            .collect();
        if !not_succeeded.is_empty() {
            return Err(CdkError::StreamsNotSucceeded(not_succeeded));
        }
        if self.publish(DestinationResult::Success) {
            tracing::info!("Destination succeeded");
        }
        Ok(())
    }

    /// Fail the destination. Returns the result in effect, which is the
    /// earlier one if a result was already set.
    pub fn mark_destination_failed(&self, cause: anyhow::Error) -> DestinationResult {
        let failed_streams = self
            .failed_streams()
            .into_iter()
            .map(|(stream, _)| stream)
            .collect();
        tracing::warn!("Destination failed: {:#}", cause);
        let failure = DestinationResult::Failure {
            cause: Arc::new(cause),
            failed_streams,
        };
        if self.publish(failure.clone()) {
            return failure;
        }
        self.destination_result().unwrap_or(failure)
    }

    /// Wait for every stream, then set the destination result from theirs.
    /// A failed stream's original cause becomes the destination cause.
    pub async fn finalize_destination(&self) -> Result<DestinationResult> {
        if self.await_all_streams_processed_successfully().await {
            self.mark_destination_succeeded()?;
        } else {
            let failed = self.failed_streams();
            let failed_streams: Vec<StreamDescriptor> =
                failed.iter().map(|(stream, _)| stream.clone()).collect();
            if let Some((stream, cause)) = failed.into_iter().next() {
                tracing::warn!(
                    "Destination failed: {} stream(s) failed, first was {}",
                    failed_streams.len(),
                    stream
                );
                self.publish(DestinationResult::Failure {
                    cause,
                    failed_streams,
                });
            }
        }
        Ok(self.await_destination_result().await)
    }

    fn publish(&self, result: DestinationResult) -> bool {
        self.destination_result.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        })
    }

    pub fn destination_result(&self) -> Option<DestinationResult> {
        self.destination_result.borrow().clone()
    }

    pub async fn await_destination_result(&self) -> DestinationResult {
        let mut rx = self.destination_result.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return DestinationResult::Failure {
                    cause: Arc::new(anyhow::anyhow!("destination result channel closed")),
                    failed_streams: Vec::new(),
                };
            }
        }
    }
}
