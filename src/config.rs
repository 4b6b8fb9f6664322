//! Load settings.
//!
//! ```toml
//! max_memory_bytes = 536870912
//! record_batch_size_bytes = 209715200
//! checkpoint_flush_interval_ms = 10000
//! max_time_without_flush_ms = 900000
//! ```
//!
//! Missing keys take their defaults.

use crate::error::{CdkError, Result};
use crate::flush::{DefaultFlushStrategy, TimeWindowTrigger};
use crate::state::ReservationManager;
use crate::time::TimeProvider;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_RECORD_BATCH_SIZE_BYTES: u64 = 200 * 1024 * 1024;
pub const DEFAULT_CHECKPOINT_FLUSH_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_MAX_TIME_WITHOUT_FLUSH_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadConfig {
    /// Capacity of the reservation pool.
    pub max_memory_bytes: u64,
    /// Buffered bytes at which writers should flush.
    pub record_batch_size_bytes: u64,
    /// Tick period of the checkpoint flush task.
    pub checkpoint_flush_interval_ms: u64,
    /// Longest a writer or the checkpoint flush task may go without flushing.
    pub max_time_without_flush_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            record_batch_size_bytes: DEFAULT_RECORD_BATCH_SIZE_BYTES,
            checkpoint_flush_interval_ms: DEFAULT_CHECKPOINT_FLUSH_INTERVAL_MS,
            max_time_without_flush_ms: DEFAULT_MAX_TIME_WITHOUT_FLUSH_MS,
        }
    }
}

impl LoadConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: LoadConfig =
            toml::from_str(source).map_err(|e| CdkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source).map_err(|e| match e {
            CdkError::Config(message) => {
                CdkError::Config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_memory_bytes", self.max_memory_bytes),
            ("record_batch_size_bytes", self.record_batch_size_bytes),
            ("checkpoint_flush_interval_ms", self.checkpoint_flush_interval_ms),
            ("max_time_without_flush_ms", self.max_time_without_flush_ms),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(CdkError::Config(format!("{} must be greater than zero", name)));
        }
        if self.record_batch_size_bytes > self.max_memory_bytes {
            return Err(CdkError::Config(format!(
                "record_batch_size_bytes ({}) exceeds max_memory_bytes ({})",
                self.record_batch_size_bytes, self.max_memory_bytes
            )));
        }
        Ok(())
    }

    pub fn checkpoint_flush_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_flush_interval_ms)
    }

    pub fn reservation_manager(&self) -> Arc<ReservationManager> {
        ReservationManager::new(self.max_memory_bytes)
    }

    pub fn flush_strategy(&self) -> DefaultFlushStrategy {
        DefaultFlushStrategy::new(self.record_batch_size_bytes)
    }

    pub fn time_window_trigger(&self, clock: Arc<dyn TimeProvider>) -> TimeWindowTrigger {
        TimeWindowTrigger::new(clock, self.max_time_without_flush_ms)
    }
}
