//! Monotonic clock abstraction
//!
//! Every timed loop in the engine (scheduler, workers, monitor, renderers)
//! reads time and sleeps through a [`Clock`] so tests can drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic time plus the ability to sleep
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's (arbitrary, fixed) epoch
    fn now(&self) -> Duration;

    /// Block the calling thread for roughly `duration`
    fn sleep(&self, duration: Duration);

    /// Convenience: current time in fractional seconds
    fn now_seconds(&self) -> f64 {
        self.now().as_secs_f64()
    }

    /// Convenience: sleep for fractional seconds (negative and NaN are ignored)
    fn sleep_seconds(&self, seconds: f64) {
        if seconds > 0.0 && seconds.is_finite() {
            self.sleep(Duration::from_secs_f64(seconds));
        }
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by `Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Hand-driven clock for tests
///
/// `now()` only moves when [`ManualClock::advance`] or [`ManualClock::set`] is
/// called. `sleep()` does not advance time; it yields for a millisecond of real
/// time so polling loops under test do not spin a core.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, by: Duration) {
        self.now_us.fetch_add(by.as_micros() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, to: Duration) {
        self.now_us.store(to.as_micros() as u64, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.now_us.load(Ordering::Acquire))
    }

    fn sleep(&self, _duration: Duration) {
        std::thread::sleep(Duration::from_millis(1));
    }
}
