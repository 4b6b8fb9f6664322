use crate::time::TimeProvider;
use std::fmt;
use std::sync::Arc;

/// A window that opens once and completes `window_width_ms` later.
///
/// `open` is idempotent until the trigger is closed: repeated calls return
/// the time of the first one. A trigger that was never opened never completes.
pub struct TimeWindowTrigger {
    clock: Arc<dyn TimeProvider>,
    window_width_ms: u64,
    opened_at_ms: Option<u64>,
}

impl TimeWindowTrigger {
    pub fn new(clock: Arc<dyn TimeProvider>, window_width_ms: u64) -> Self {
        Self {
            clock,
            window_width_ms,
            opened_at_ms: None,
        }
    }

    pub fn window_width_ms(&self) -> u64 {
        self.window_width_ms
    }

    /// Open the window if it is not open yet. Returns the opening time.
    pub fn open(&mut self) -> u64 {
        let clock = &self.clock;
        *self
            .opened_at_ms
            .get_or_insert_with(|| clock.current_time_millis())
    }

    pub fn is_open(&self) -> bool {
        self.opened_at_ms.is_some()
    }

    /// True once `window_width_ms` have elapsed since `open` (inclusive).
    pub fn is_complete(&self) -> bool {
        match self.opened_at_ms {
            Some(opened_at) => {
                self.clock.current_time_millis().saturating_sub(opened_at) >= self.window_width_ms
            }
            None => false,
        }
    }

    /// Re-arm the trigger. Returns the opening time of the closed window.
    pub fn close(&mut self) -> Option<u64> {
        self.opened_at_ms.take()
    }
}

impl fmt::Debug for TimeWindowTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWindowTrigger")
            .field("window_width_ms", &self.window_width_ms)
            .field("opened_at_ms", &self.opened_at_ms)
            .finish()
    }
}
