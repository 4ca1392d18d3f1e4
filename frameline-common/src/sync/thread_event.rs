//! Single-assignment event resolved by one provider thread

use super::mutex::TrackedMutexGuard;
use super::tracker::{SharedTracker, WaitScope};
use super::waitable::WaitPoint;
use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

enum EventState<T> {
    Pending,
    Set(T),
    Abandoned,
}

/// One-shot value that any number of threads may wait on
///
/// The value is assigned once with [`ThreadEvent::signal`]; every waiter then
/// receives a clone. [`ThreadEvent::abandon`] wakes waiters with an error
/// instead. The provider thread is the one expected to signal and is what
/// deadlock detection follows.
pub struct ThreadEvent<T> {
    point: Arc<WaitPoint>,
    tracker: SharedTracker,
    state: Mutex<EventState<T>>,
    cond: Condvar,
}

impl<T: Clone> ThreadEvent<T> {
    pub fn new(name: impl Into<String>, tracker: SharedTracker) -> Self {
        Self {
            point: WaitPoint::new(name),
            tracker,
            state: Mutex::new(EventState::Pending),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.point.name()
    }

    pub fn provider(&self) -> Option<ThreadId> {
        self.point.provider()
    }

    pub fn set_provider(&self, provider: ThreadId) {
        self.point.set_provider(Some(provider));
        self.tracker.provider_changed(&self.point);
    }

    pub fn is_set(&self) -> bool {
        matches!(*self.lock(), EventState::Set(_))
    }

    /// True once signalled or abandoned
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.lock(), EventState::Pending)
    }

    /// Assign the value and wake all waiters; returns false if already set
    pub fn signal(&self, value: T) -> bool {
        let mut state = self.lock();
        if matches!(*state, EventState::Set(_)) {
            return false;
        }
        *state = EventState::Set(value);
        self.point.set_resolved(true);
        self.cond.notify_all();
        true
    }

    /// Wake waiters with an error if no value was assigned
    pub fn abandon(&self) -> bool {
        let mut state = self.lock();
        if !matches!(*state, EventState::Pending) {
            return false;
        }
        *state = EventState::Abandoned;
        self.point.set_resolved(true);
        self.cond.notify_all();
        true
    }

    /// Return to the pending state so the event can be waited on again
    pub fn reset(&self) {
        self.tracker.point_reset(&self.point);
        let mut state = self.lock();
        *state = EventState::Pending;
        self.point.set_resolved(false);
    }

    /// Block until the event is signalled or abandoned
    pub fn wait(&self) -> Result<T> {
        let mut state = self.lock();
        if let Some(result) = self.resolved(&state) {
            return result;
        }
        let _scope = WaitScope::enter(&*self.tracker, &self.point);
        loop {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(result) = self.resolved(&state) {
                return result;
            }
        }
    }

    /// Like [`ThreadEvent::wait`] but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        if let Some(result) = self.resolved(&state) {
            return result;
        }
        let _scope = WaitScope::enter(&*self.tracker, &self.point);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(self.point.name().to_string()));
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            if let Some(result) = self.resolved(&state) {
                return result;
            }
        }
    }

    /// Reset while `guard` is held, then wait with the mutex released
    ///
    /// The reset happens before the unlock so a signal issued by a thread that
    /// takes the mutex next cannot be lost.
    pub fn reset_and_wait_while_unlocked<'a, U>(
        &self,
        guard: TrackedMutexGuard<'a, U>,
    ) -> (TrackedMutexGuard<'a, U>, Result<T>) {
        self.reset();
        TrackedMutexGuard::unlocked(guard, || self.wait())
    }

    fn lock(&self) -> MutexGuard<'_, EventState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolved(&self, state: &EventState<T>) -> Option<Result<T>> {
        match state {
            EventState::Pending => None,
            EventState::Set(value) => Some(Ok(value.clone())),
            EventState::Abandoned => Some(Err(Error::Abandoned(self.point.name().to_string()))),
        }
    }
}
