//! Periodic checkpoint flushing.
//!
//! The task wakes every tick and flushes ready checkpoints once
//! `max_time_without_flush_ms` have passed since its previous flush. It exits
//! when the sync is no longer active or when shutdown is requested, flushing
//! one last time on the way out.

use crate::error::Result;
use crate::flush::trigger::TimeWindowTrigger;
use crate::state::{CheckpointManager, SyncManager};
use crate::time::TimeProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct CheckpointFlushTask<T: Send + 'static> {
    checkpoint_manager: Arc<dyn CheckpointManager<T>>,
    sync_manager: Arc<SyncManager>,
    clock: Arc<dyn TimeProvider>,
    tick_interval: Duration,
    max_time_without_flush_ms: u64,
}

impl<T: Send + 'static> CheckpointFlushTask<T> {
    pub fn new(
        checkpoint_manager: Arc<dyn CheckpointManager<T>>,
        sync_manager: Arc<SyncManager>,
        clock: Arc<dyn TimeProvider>,
        tick_interval: Duration,
        max_time_without_flush_ms: u64,
    ) -> Self {
        Self {
            checkpoint_manager,
            sync_manager,
            clock,
            tick_interval,
            max_time_without_flush_ms,
        }
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> FlushTaskHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        FlushTaskHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Returns the number of checkpoints forwarded over the task's lifetime.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<usize> {
        let mut trigger =
            TimeWindowTrigger::new(self.clock.clone(), self.max_time_without_flush_ms);
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut forwarded = 0;

        trigger.open();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                // A dropped handle counts as a shutdown request.
                _ = shutdown.changed() => {
                    tracing::debug!("Checkpoint flush task shutting down");
                    break;
                }
            }

            if !self.sync_manager.is_active() {
                tracing::debug!("Sync no longer active, stopping checkpoint flush task");
                break;
            }

            if trigger.is_complete() {
                let count = self.checkpoint_manager.flush_ready_checkpoint_messages().await?;
                if count > 0 {
                    tracing::debug!("Periodic flush forwarded {} checkpoints", count);
                }
                forwarded += count;
                trigger.close();
                trigger.open();
            }
        }

        forwarded += self.checkpoint_manager.flush_ready_checkpoint_messages().await?;
        Ok(forwarded)
    }
}

/// Handle to a spawned [`CheckpointFlushTask`].
pub struct FlushTaskHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Result<usize>>,
}

impl FlushTaskHandle {
    /// Ask the task to stop and wait for its final flush.
    pub async fn shutdown(self) -> Result<usize> {
        self.shutdown.send_replace(true);
        self.join.await?
    }

    /// Wait for the task to stop on its own.
    pub async fn join(self) -> Result<usize> {
        let FlushTaskHandle { shutdown, join } = self;
        let result = join.await?;
        drop(shutdown);
        result
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
