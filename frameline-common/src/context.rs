//! Per-engine services shared by every thread

use crate::clock::{SharedClock, SystemClock};
use crate::sync::{default_tracker, SharedTracker};

/// Clock plus wait tracker handed to every component at construction
///
/// Cheap to clone. Call [`SyncContext::teardown`] once all engine threads have
/// been joined.
#[derive(Clone)]
pub struct SyncContext {
    clock: SharedClock,
    tracker: SharedTracker,
}

impl SyncContext {
    /// Wall clock and the build's default tracker
    pub fn new() -> Self {
        Self {
            clock: SystemClock::shared(),
            tracker: default_tracker(),
        }
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            tracker: default_tracker(),
        }
    }

    pub fn with_parts(clock: SharedClock, tracker: SharedTracker) -> Self {
        Self { clock, tracker }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    pub fn teardown(&self) {
        self.tracker.teardown();
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new()
    }
}
