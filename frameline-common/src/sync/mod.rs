//! Tracked synchronization primitives
//!
//! Mutexes, one-shot events and threads that report every blocking wait to a
//! [`WaitTracker`] so debug builds can detect deadlock cycles.

pub mod mutex;
pub mod thread;
pub mod thread_event;
pub mod tracker;
pub mod waitable;

pub use mutex::{TrackedMutex, TrackedMutexGuard, TrackedSharedGuard};
pub use thread::TrackedThread;
pub use thread_event::ThreadEvent;
pub use tracker::{default_tracker, NoopTracker, SharedTracker, WaitScope, WaitTracker};
pub use waitable::WaitPoint;

#[cfg(all(debug_assertions, feature = "deadlock-detection"))]
pub use tracker::{DeadlockAction, DeadlockReport, WaitGraph};
