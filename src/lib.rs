//! Checkpoint and backpressure core for destination connectors.
//!
//! Records arrive tagged with a stream and a checkpoint id, and checkpoint
//! messages arrive interleaved with them. Writers persist records in
//! batches and report progress back. A checkpoint is forwarded downstream
//! only once every record it covers is durable, so a restart from any
//! forwarded checkpoint never loses data.
//!
//! - [`state::StreamManager`]: per-stream read counts and persistence coverage
//! - [`state::SyncManager`]: catalog-wide lifecycle and the final result
//! - [`state::CheckpointManager`]: ordered release of checkpoints, per stream or global
//! - [`state::ReservationManager`]: byte budget that bounds writer memory
//! - [`flush`]: policies and a background task that decide when to flush

pub mod catalog;
pub mod config;
pub mod error;
pub mod flush;
pub mod logging;
pub mod state;
pub mod time;

pub use catalog::{DestinationCatalog, StreamDescriptor};
pub use config::LoadConfig;
pub use error::{CdkError, ErrorKind, Result};
pub use time::{MockTimeProvider, SystemTimeProvider, TimeProvider};
