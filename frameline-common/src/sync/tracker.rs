//! Waiter/provider bookkeeping for deadlock detection
//!
//! Every blocking wait performed by the tracked primitives is reported to a
//! [`WaitTracker`]. Debug builds with the `deadlock-detection` feature use
//! [`WaitGraph`], which walks the provider chain before each wait and treats a
//! cycle back to the waiting thread as a fatal deadlock. Release builds get
//! [`NoopTracker`].

use super::waitable::WaitPoint;
use std::sync::Arc;
use std::thread::ThreadId;

/// Diagnostics service notified around every blocking wait
pub trait WaitTracker: Send + Sync {
    /// Record a human-readable name for a thread (used in deadlock reports)
    fn register_thread(&self, thread: ThreadId, name: &str);

    /// Called by a tracked thread right before it exits
    fn thread_exiting(&self, thread: ThreadId);

    /// The current thread is about to block on `point`
    fn begin_wait(&self, point: &Arc<WaitPoint>);

    /// The current thread stopped waiting
    fn end_wait(&self);

    /// `point` has a new provider thread
    fn provider_changed(&self, point: &Arc<WaitPoint>);

    /// `point` is being reset; nobody may be waiting on it
    fn point_reset(&self, point: &Arc<WaitPoint>);

    /// Drop all recorded state
    fn teardown(&self);
}

/// Shared tracker handle
pub type SharedTracker = Arc<dyn WaitTracker>;

/// RAII scope for one blocking wait
pub struct WaitScope<'a> {
    tracker: &'a dyn WaitTracker,
}

impl<'a> WaitScope<'a> {
    pub fn enter(tracker: &'a dyn WaitTracker, point: &Arc<WaitPoint>) -> Self {
        tracker.begin_wait(point);
        Self { tracker }
    }
}

impl Drop for WaitScope<'_> {
    fn drop(&mut self) {
        self.tracker.end_wait();
    }
}

/// Tracker that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl WaitTracker for NoopTracker {
    fn register_thread(&self, _thread: ThreadId, _name: &str) {}
    fn thread_exiting(&self, _thread: ThreadId) {}
    fn begin_wait(&self, _point: &Arc<WaitPoint>) {}
    fn end_wait(&self) {}
    fn provider_changed(&self, _point: &Arc<WaitPoint>) {}
    fn point_reset(&self, _point: &Arc<WaitPoint>) {}
    fn teardown(&self) {}
}

/// Tracker appropriate for the current build profile
pub fn default_tracker() -> SharedTracker {
    #[cfg(all(debug_assertions, feature = "deadlock-detection"))]
    {
        Arc::new(graph::WaitGraph::new())
    }
    #[cfg(not(all(debug_assertions, feature = "deadlock-detection")))]
    {
        Arc::new(NoopTracker)
    }
}

#[cfg(all(debug_assertions, feature = "deadlock-detection"))]
pub use graph::{DeadlockAction, DeadlockReport, WaitGraph};

#[cfg(all(debug_assertions, feature = "deadlock-detection"))]
mod graph {
    use super::{WaitPoint, WaitTracker};
    use std::collections::{HashMap, HashSet};
    use std::fmt;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::thread::{self, ThreadId};
    use tracing::{error, trace};

    /// What to do once a deadlock has been found
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DeadlockAction {
        /// Log the chain and abort the process
        Abort,
        /// Log the chain and panic in the waiting thread
        Panic,
    }

    /// Wait chain that closed into a cycle
    #[derive(Debug, Clone)]
    pub struct DeadlockReport {
        pub chain: Vec<String>,
    }

    impl fmt::Display for DeadlockReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for line in &self.chain {
                writeln!(f, "  {}", line)?;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct GraphState {
        waiting: HashMap<ThreadId, Arc<WaitPoint>>,
        names: HashMap<ThreadId, String>,
    }

    impl GraphState {
        fn name(&self, thread: ThreadId) -> String {
            match self.names.get(&thread) {
                Some(name) => name.clone(),
                None => format!("{:?}", thread),
            }
        }

        /// Walk providers starting at `point`; `waiter` is the thread about to
        /// block on it.
        fn find_cycle(&self, point: &Arc<WaitPoint>, waiter: ThreadId) -> Option<DeadlockReport> {
            let mut seen: HashSet<ThreadId> = HashSet::new();
            seen.insert(waiter);
            let mut chain = Vec::new();
            let mut current = waiter;
            let mut waiting_on = Arc::clone(point);

            for depth in 0.. {
                if waiting_on.is_resolved() {
                    return None;
                }
                let provider = waiting_on.provider()?;
                // Past the first hop, a thread "waiting" on its own object is a
                // transient state between setting the provider and waking up.
                if depth > 0 && provider == current {
                    return None;
                }

                chain.push(format!(
                    "\"{}\" waiting on \"{}\" provided by \"{}\"",
                    self.name(current),
                    waiting_on.name(),
                    self.name(provider)
                ));

                if seen.contains(&provider) {
                    return Some(DeadlockReport { chain });
                }

                let next = self.waiting.get(&provider)?;
                seen.insert(provider);
                current = provider;
                waiting_on = Arc::clone(next);
            }
            None
        }
    }

    /// Process-wide waiter/provider graph
    pub struct WaitGraph {
        state: Mutex<GraphState>,
        action: DeadlockAction,
    }

    impl WaitGraph {
        pub fn new() -> Self {
            Self::with_action(DeadlockAction::Abort)
        }

        pub fn with_action(action: DeadlockAction) -> Self {
            Self {
                state: Mutex::new(GraphState::default()),
                action,
            }
        }

        /// Check whether `waiter` blocking on `point` would close a cycle
        pub fn check(&self, point: &Arc<WaitPoint>, waiter: ThreadId) -> Option<DeadlockReport> {
            self.lock().find_cycle(point, waiter)
        }

        /// Number of threads currently recorded as waiting
        pub fn waiting_count(&self) -> usize {
            self.lock().waiting.len()
        }

        fn lock(&self) -> MutexGuard<'_, GraphState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn fail(&self, report: DeadlockReport) {
            error!("Deadlock detected:\n{}", report);
            match self.action {
                DeadlockAction::Abort => std::process::abort(),
                DeadlockAction::Panic => panic!("deadlock detected:\n{}", report),
            }
        }
    }

    impl Default for WaitGraph {
        fn default() -> Self {
            Self::new()
        }
    }

    impl WaitTracker for WaitGraph {
        fn register_thread(&self, thread: ThreadId, name: &str) {
            self.lock().names.insert(thread, name.to_string());
        }

        fn thread_exiting(&self, thread: ThreadId) {
            let mut state = self.lock();
            for (waiter, point) in state.waiting.iter() {
                if point.provider() == Some(thread) && !point.is_resolved() {
                    error!(
                        "Thread \"{}\" exiting while \"{}\" waits on \"{}\" it provides",
                        state.name(thread),
                        state.name(*waiter),
                        point.name()
                    );
                }
            }
            state.names.remove(&thread);
        }

        fn begin_wait(&self, point: &Arc<WaitPoint>) {
            let me = thread::current().id();
            let report = {
                let mut state = self.lock();
                if let Some(previous) = state.waiting.get(&me) {
                    error!(
                        "Thread \"{}\" waiting on \"{}\" while still waiting on \"{}\"",
                        state.name(me),
                        point.name(),
                        previous.name()
                    );
                }
                let report = state.find_cycle(point, me);
                if report.is_none() {
                    trace!("\"{}\" waiting on \"{}\"", state.name(me), point.name());
                    state.waiting.insert(me, Arc::clone(point));
                }
                report
            };
            if let Some(report) = report {
                self.fail(report);
            }
        }

        fn end_wait(&self) {
            self.lock().waiting.remove(&thread::current().id());
        }

        fn provider_changed(&self, point: &Arc<WaitPoint>) {
            let report = {
                let state = self.lock();
                let provider = match point.provider() {
                    Some(p) => p,
                    None => return,
                };
                match state.waiting.get(&provider) {
                    Some(target) => state.find_cycle(target, provider),
                    None => None,
                }
            };
            if let Some(report) = report {
                self.fail(report);
            }
        }

        fn point_reset(&self, point: &Arc<WaitPoint>) {
            let state = self.lock();
            for (waiter, target) in state.waiting.iter() {
                if Arc::ptr_eq(target, point) {
                    error!(
                        "\"{}\" reset while \"{}\" is waiting on it",
                        point.name(),
                        state.name(*waiter)
                    );
                }
            }
        }

        fn teardown(&self) {
            let mut state = self.lock();
            state.waiting.clear();
            state.names.clear();
        }
    }

}
