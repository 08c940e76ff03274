//! The kernel-window heuristic.
//!
//! Applications that submit kernels far faster than the GPU retires
//! them would still have a deep backlog in flight when asked to release
//! the lock, and the drain before LOCK_RELEASED would blow way past the
//! time quantum. To bound the worst-case drain, the agent synchronizes
//! after every `window` launches and adapts the window to how long that
//! synchronize took.

use std::time::Duration;

/// Ceiling for the adaptive window.
pub const WINDOW_MAX: u32 = 2048;

/// A synchronize at least this long means a huge backlog; the window
/// snaps back to 1.
const SYNC_HUGE: Duration = Duration::from_secs(10);

/// A synchronize at least this long halves the window.
const SYNC_SLOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct KernelWindow {
    window: u32,
    since_sync: u32,
}

impl Default for KernelWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelWindow {
    pub fn new() -> Self {
        KernelWindow {
            window: 1,
            since_sync: 0,
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Count one kernel launch. Returns true when the window is full
    /// and the caller must synchronize.
    pub fn note_launch(&mut self) -> bool {
        self.since_sync += 1;
        self.since_sync >= self.window
    }

    /// Feed back how long the post-window synchronize took and adapt.
    pub fn note_sync(&mut self, took: Duration) {
        if took >= SYNC_HUGE {
            // Possibly a series of huge kernels; falling back to the
            // previous window is too risky. Restart from 1.
            self.window = 1;
        } else if took >= SYNC_SLOW {
            self.window = (self.window / 2).max(1);
        } else {
            self.window = (self.window * 2).min(WINDOW_MAX);
        }
        self.since_sync = 0;
    }

    /// Forget accumulated launches. Called when the lock is
    /// re-acquired, since whatever was in flight has long drained.
    pub fn reset_count(&mut self) {
        self.since_sync = 0;
    }

    /// Tighten to the initial window ahead of a forced drain.
    pub fn reset_window(&mut self) {
        self.window = 1;
    }
}
