//! Checkpoint release.
//!
//! Checkpoint messages are queued in arrival order and forwarded to the
//! output consumer only once the records they cover are persisted. Two
//! mutually exclusive implementations share the [`CheckpointManager`]
//! interface:
//!
//! - [`StreamCheckpointManager`]: one queue per stream. Each checkpoint is
//!   bounded by a single record index, or by a checkpoint id when the manager
//!   is built with [`StreamCheckpointManager::by_checkpoint_id`].
//! - [`GlobalCheckpointManager`]: one queue, each checkpoint bounded by one
//!   record index per constituent stream, released only when every
//!   constituent is covered.
//!
//! Calling the other mode's `add_*` method is a protocol violation.
//!
//! If the output consumer fails mid-flush, the checkpoint it failed on counts
//! as delivered and everything behind it goes back to the front of its queue.

use crate::catalog::StreamDescriptor;
use crate::error::{CdkError, Result};
use crate::state::checkpoint::CheckpointId;
use crate::state::sync_manager::SyncManager;
use crate::time::TimeProvider;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Receives each released checkpoint's original payload, in order per key.
#[async_trait]
pub trait OutputConsumer<T>: Send + Sync {
    async fn consume(&self, checkpoint: T) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: Send + 'static> OutputConsumer<T> for mpsc::UnboundedSender<T> {
    async fn consume(&self, checkpoint: T) -> anyhow::Result<()> {
        self.send(checkpoint)
            .map_err(|_| anyhow::anyhow!("checkpoint output channel closed"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// One queue per stream, bounded by record index.
    PerStream,
    /// One queue per stream, bounded by checkpoint id. Readiness comes from
    /// the per-checkpoint counts writers report.
    PerStreamByCheckpointId,
    /// One queue of cross-stream checkpoints.
    Global,
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointMode::PerStream => f.write_str("per-stream"),
            CheckpointMode::PerStreamByCheckpointId => f.write_str("per-stream by checkpoint id"),
            CheckpointMode::Global => f.write_str("global"),
        }
    }
}

#[async_trait]
pub trait CheckpointManager<T: Send + 'static>: Send + Sync {
    fn mode(&self) -> CheckpointMode;

    /// Queue a checkpoint covering `stream`'s records `[0, index)`. In
    /// [`CheckpointMode::PerStreamByCheckpointId`], `index` is the id of the
    /// checkpoint being closed.
    fn add_stream_checkpoint(
        &self,
        stream: &StreamDescriptor,
        index: u64,
        checkpoint: T,
    ) -> Result<()>;

    /// Queue a checkpoint covering `[0, index)` of every listed stream.
    fn add_global_checkpoint(
        &self,
        stream_indexes: Vec<(StreamDescriptor, u64)>,
        checkpoint: T,
    ) -> Result<()>;

    /// Forward every checkpoint that is now ready, front to back per key,
    /// stopping at the first one that is not. Returns the number forwarded.
    async fn flush_ready_checkpoint_messages(&self) -> Result<usize>;

    /// Per stream, the bound of the oldest pending checkpoint.
    fn get_next_checkpoint_indexes(&self) -> HashMap<StreamDescriptor, u64>;

    fn get_last_successful_flush_time_ms(&self) -> u64;
}

/// Build the manager for `mode`. The mode is fixed for the manager's lifetime.
pub fn new_checkpoint_manager<T: Send + 'static>(
    mode: CheckpointMode,
    sync_manager: Arc<SyncManager>,
    output: Arc<dyn OutputConsumer<T>>,
    time_provider: Arc<dyn TimeProvider>,
) -> Arc<dyn CheckpointManager<T>> {
    match mode {
        CheckpointMode::PerStream => Arc::new(StreamCheckpointManager::new(
            sync_manager,
            output,
            time_provider,
        )),
        CheckpointMode::PerStreamByCheckpointId => Arc::new(
            StreamCheckpointManager::by_checkpoint_id(sync_manager, output, time_provider),
        ),
        CheckpointMode::Global => Arc::new(GlobalCheckpointManager::new(
            sync_manager,
            output,
            time_provider,
        )),
    }
}

fn lock<Q>(mutex: &Mutex<Q>) -> MutexGuard<'_, Q> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Shared emission
// =============================================================================

/// A checkpoint taken off its queue for delivery.
trait Pending<T>: Send {
    fn describe(&self) -> String;
    fn into_checkpoint(self) -> T;
}

struct Emitter<T> {
    sync_manager: Arc<SyncManager>,
    output: Arc<dyn OutputConsumer<T>>,
    time_provider: Arc<dyn TimeProvider>,
    // Serializes flushes so emission order matches queue order.
    flush_lock: tokio::sync::Mutex<()>,
    last_flush_ms: AtomicU64,
}

impl<T: Send + 'static> Emitter<T> {
    fn new(
        sync_manager: Arc<SyncManager>,
        output: Arc<dyn OutputConsumer<T>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let now = time_provider.current_time_millis();
        Self {
            sync_manager,
            output,
            time_provider,
            flush_lock: tokio::sync::Mutex::new(()),
            last_flush_ms: AtomicU64::new(now),
        }
    }

    fn is_persisted_until(&self, stream: &StreamDescriptor, index: u64) -> Result<bool> {
        Ok(self
            .sync_manager
            .get_stream_manager(stream)?
            .are_records_persisted_until(index))
    }

    fn is_persisted_until_checkpoint(
        &self,
        stream: &StreamDescriptor,
        checkpoint_id: CheckpointId,
    ) -> Result<bool> {
        Ok(self
            .sync_manager
            .get_stream_manager(stream)?
            .are_records_persisted_until_checkpoint(checkpoint_id))
    }

    fn check_known(&self, stream: &StreamDescriptor) -> Result<()> {
        self.sync_manager.get_stream_manager(stream).map(|_| ())
    }

    /// Deliver `ready` in order. On failure, returns the checkpoints that
    /// were never handed to the consumer, still in order.
    async fn emit<P: Pending<T>>(
        &self,
        mut ready: VecDeque<P>,
    ) -> std::result::Result<usize, (CdkError, VecDeque<P>)> {
        let mut forwarded = 0;
        while let Some(pending) = ready.pop_front() {
            tracing::debug!("Releasing checkpoint for {}", pending.describe());
            if let Err(e) = self.output.consume(pending.into_checkpoint()).await {
                tracing::warn!(
                    "Output consumer failed, requeueing {} checkpoints",
                    ready.len()
                );
                return Err((CdkError::Output(e), ready));
            }
            forwarded += 1;
        }
        self.last_flush_ms
            .store(self.time_provider.current_time_millis(), Ordering::SeqCst);
        Ok(forwarded)
    }

    fn last_flush_ms(&self) -> u64 {
        self.last_flush_ms.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Per-stream
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    RecordIndex,
    CheckpointId,
}

struct StreamPending<T> {
    stream: StreamDescriptor,
    bound: u64,
    checkpoint: T,
}

impl<T: Send> Pending<T> for StreamPending<T> {
    fn describe(&self) -> String {
        format!("{} at {}", self.stream, self.bound)
    }

    fn into_checkpoint(self) -> T {
        self.checkpoint
    }
}

struct StreamQueues<T> {
    pending: HashMap<StreamDescriptor, VecDeque<(u64, T)>>,
    // Survives flushes so a regression is caught even with an empty queue.
    last_bound: HashMap<StreamDescriptor, u64>,
}

pub struct StreamCheckpointManager<T> {
    emitter: Emitter<T>,
    readiness: Readiness,
    queues: Mutex<StreamQueues<T>>,
}

impl<T: Send + 'static> StreamCheckpointManager<T> {
    /// Checkpoints bounded by record index, released on range coverage.
    pub fn new(
        sync_manager: Arc<SyncManager>,
        output: Arc<dyn OutputConsumer<T>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self::with_readiness(sync_manager, output, time_provider, Readiness::RecordIndex)
    }

    /// Checkpoints bounded by checkpoint id, released once every checkpoint
    /// up to and including that id is persisted by counts.
    pub fn by_checkpoint_id(
        sync_manager: Arc<SyncManager>,
        output: Arc<dyn OutputConsumer<T>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self::with_readiness(sync_manager, output, time_provider, Readiness::CheckpointId)
    }

    fn with_readiness(
        sync_manager: Arc<SyncManager>,
        output: Arc<dyn OutputConsumer<T>>,
        time_provider: Arc<dyn TimeProvider>,
        readiness: Readiness,
    ) -> Self {
        Self {
            emitter: Emitter::new(sync_manager, output, time_provider),
            readiness,
            queues: Mutex::new(StreamQueues {
                pending: HashMap::new(),
                last_bound: HashMap::new(),
            }),
        }
    }

    fn is_ready(&self, stream: &StreamDescriptor, bound: u64) -> Result<bool> {
        match self.readiness {
            Readiness::RecordIndex => self.emitter.is_persisted_until(stream, bound),
            Readiness::CheckpointId => self
                .emitter
                .is_persisted_until_checkpoint(stream, CheckpointId(bound)),
        }
    }

    fn take_ready(&self) -> Result<VecDeque<StreamPending<T>>> {
        let mut queues = lock(&self.queues);
        let mut ready = VecDeque::new();
        for stream in &self.emitter.sync_manager.catalog().streams {
            let Some(queue) = queues.pending.get_mut(stream) else {
                continue;
            };
            while let Some((bound, _)) = queue.front() {
                if !self.is_ready(stream, *bound)? {
                    break;
                }
                if let Some((bound, checkpoint)) = queue.pop_front() {
                    ready.push_back(StreamPending {
                        stream: stream.clone(),
                        bound,
                        checkpoint,
                    });
                }
            }
            if queue.is_empty() {
                queues.pending.remove(stream);
            }
        }
        Ok(ready)
    }

    fn requeue(&self, unforwarded: VecDeque<StreamPending<T>>) {
        let mut queues = lock(&self.queues);
        for pending in unforwarded.into_iter().rev() {
            queues
                .pending
                .entry(pending.stream)
                .or_default()
                .push_front((pending.bound, pending.checkpoint));
        }
    }
}

#[async_trait]
impl<T: Send + 'static> CheckpointManager<T> for StreamCheckpointManager<T> {
    fn mode(&self) -> CheckpointMode {
        match self.readiness {
            Readiness::RecordIndex => CheckpointMode::PerStream,
            Readiness::CheckpointId => CheckpointMode::PerStreamByCheckpointId,
        }
    }

    fn add_stream_checkpoint(
        &self,
        stream: &StreamDescriptor,
        index: u64,
        checkpoint: T,
    ) -> Result<()> {
        self.emitter.check_known(stream)?;
        let mut queues = lock(&self.queues);
        if let Some(&last) = queues.last_bound.get(stream) {
            if index <= last {
                return Err(CdkError::protocol(format!(
                    "checkpoint bound {} for stream {} does not follow previous bound {}",
                    index, stream, last
                )));
            }
        }
        queues.last_bound.insert(stream.clone(), index);
        queues
            .pending
            .entry(stream.clone())
            .or_default()
            .push_back((index, checkpoint));
        Ok(())
    }

    fn add_global_checkpoint(
        &self,
        _stream_indexes: Vec<(StreamDescriptor, u64)>,
        _checkpoint: T,
    ) -> Result<()> {
        Err(CdkError::protocol(
            "global checkpoint received by a per-stream checkpoint manager",
        ))
    }

    async fn flush_ready_checkpoint_messages(&self) -> Result<usize> {
        let _flush = self.emitter.flush_lock.lock().await;
        let ready = self.take_ready()?;
        match self.emitter.emit(ready).await {
            Ok(forwarded) => Ok(forwarded),
            Err((e, unforwarded)) => {
                self.requeue(unforwarded);
                Err(e)
            }
        }
    }

    fn get_next_checkpoint_indexes(&self) -> HashMap<StreamDescriptor, u64> {
        lock(&self.queues)
            .pending
            .iter()
            .filter_map(|(stream, queue)| queue.front().map(|(bound, _)| (stream.clone(), *bound)))
            .collect()
    }

    fn get_last_successful_flush_time_ms(&self) -> u64 {
        self.emitter.last_flush_ms()
    }
}

// =============================================================================
// Global
// =============================================================================

struct GlobalCheckpoint<T> {
    stream_indexes: Vec<(StreamDescriptor, u64)>,
    checkpoint: T,
}

impl<T: Send> Pending<T> for GlobalCheckpoint<T> {
    fn describe(&self) -> String {
        format!("global checkpoint over {} streams", self.stream_indexes.len())
    }

    fn into_checkpoint(self) -> T {
        self.checkpoint
    }
}

struct GlobalQueue<T> {
    pending: VecDeque<GlobalCheckpoint<T>>,
    last_index: HashMap<StreamDescriptor, u64>,
}

pub struct GlobalCheckpointManager<T> {
    emitter: Emitter<T>,
    queue: Mutex<GlobalQueue<T>>,
}

impl<T: Send + 'static> GlobalCheckpointManager<T> {
    pub fn new(
        sync_manager: Arc<SyncManager>,
        output: Arc<dyn OutputConsumer<T>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            emitter: Emitter::new(sync_manager, output, time_provider),
            queue: Mutex::new(GlobalQueue {
                pending: VecDeque::new(),
                last_index: HashMap::new(),
            }),
        }
    }

    fn is_ready(&self, global: &GlobalCheckpoint<T>) -> Result<bool> {
        for (stream, index) in &global.stream_indexes {
            if !self.emitter.is_persisted_until(stream, *index)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn take_ready(&self) -> Result<VecDeque<GlobalCheckpoint<T>>> {
        let mut queue = lock(&self.queue);
        let mut ready = VecDeque::new();
        while let Some(front) = queue.pending.front() {
            if !self.is_ready(front)? {
                break;
            }
            if let Some(global) = queue.pending.pop_front() {
                ready.push_back(global);
            }
        }
        Ok(ready)
    }

    fn requeue(&self, unforwarded: VecDeque<GlobalCheckpoint<T>>) {
        let mut queue = lock(&self.queue);
        for global in unforwarded.into_iter().rev() {
            queue.pending.push_front(global);
        }
    }
}

#[async_trait]
impl<T: Send + 'static> CheckpointManager<T> for GlobalCheckpointManager<T> {
    fn mode(&self) -> CheckpointMode {
        CheckpointMode::Global
    }

    fn add_stream_checkpoint(
        &self,
        stream: &StreamDescriptor,
        _index: u64,
        _checkpoint: T,
    ) -> Result<()> {
        Err(CdkError::protocol(format!(
            "stream checkpoint for {} received by a global checkpoint manager",
            stream
        )))
    }

    fn add_global_checkpoint(
        &self,
        stream_indexes: Vec<(StreamDescriptor, u64)>,
        checkpoint: T,
    ) -> Result<()> {
        let mut seen = HashSet::with_capacity(stream_indexes.len());
        for (stream, _) in &stream_indexes {
            self.emitter.check_known(stream)?;
            if !seen.insert(stream) {
                return Err(CdkError::protocol(format!(
                    "stream {} listed twice in one global checkpoint",
                    stream
                )));
            }
        }

        let mut queue = lock(&self.queue);
        for (stream, index) in &stream_indexes {
            if let Some(&last) = queue.last_index.get(stream) {
                if *index < last {
                    return Err(CdkError::protocol(format!(
                        "global checkpoint index {} for stream {} regresses from {}",
                        index, stream, last
                    )));
                }
            }
        }
        for (stream, index) in &stream_indexes {
            queue.last_index.insert(stream.clone(), *index);
        }
        queue.pending.push_back(GlobalCheckpoint {
            stream_indexes,
            checkpoint,
        });
        Ok(())
    }

    async fn flush_ready_checkpoint_messages(&self) -> Result<usize> {
        let _flush = self.emitter.flush_lock.lock().await;
        let ready = self.take_ready()?;
        match self.emitter.emit(ready).await {
            Ok(forwarded) => Ok(forwarded),
            Err((e, unforwarded)) => {
                self.requeue(unforwarded);
                Err(e)
            }
        }
    }

    fn get_next_checkpoint_indexes(&self) -> HashMap<StreamDescriptor, u64> {
        lock(&self.queue)
            .pending
            .front()
            .map(|global| global.stream_indexes.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn get_last_successful_flush_time_ms(&self) -> u64 {
        self.emitter.last_flush_ms()
    }
}
