//! Sync-wide and per-stream bookkeeping.
//!
//! ```text
//! records ──> StreamManager.increment_read_count ─┐
//! batches ──> StreamManager.update_batch_state ───┤  coverage
//! checkpoints ──> CheckpointManager.add_* ────────┴──> flush ──> OutputConsumer
//!
//! SyncManager: one StreamManager per catalog stream, sync-level result
//! ReservationManager: byte budget for writer buffers
//! ```

pub mod checkpoint;
pub mod checkpoint_manager;
pub mod range_set;
pub mod reservation;
pub mod stream_manager;
pub mod sync_manager;

pub use checkpoint::{BatchEnvelope, BatchState, CheckpointId, CheckpointValue};
pub use checkpoint_manager::{
    new_checkpoint_manager, CheckpointManager, CheckpointMode, GlobalCheckpointManager,
    OutputConsumer, StreamCheckpointManager,
};
pub use range_set::RangeSet;
pub use reservation::{Reservation, ReservationManager};
pub use stream_manager::{StreamManager, StreamResult};
pub use sync_manager::{DestinationResult, SyncManager};
