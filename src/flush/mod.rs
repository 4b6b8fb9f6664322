//! When to flush.
//!
//! Writers decide when to ask for a flush with a [`FlushStrategy`] (size or
//! record count) and a [`TimeWindowTrigger`] (age). [`CheckpointFlushTask`]
//! drives `flush_ready_checkpoint_messages` on a timer.

pub mod strategy;
pub mod task;
pub mod trigger;

pub use strategy::{DefaultFlushStrategy, FlushStrategy, RecordCountFlushStrategy};
pub use task::{CheckpointFlushTask, FlushTaskHandle};
pub use trigger::TimeWindowTrigger;
