//! Mutex with exclusive and shared modes that reports waits to the tracker

use super::tracker::{SharedTracker, WaitScope};
use super::waitable::WaitPoint;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{
    Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::thread::{self, ThreadId};

/// Reader/writer lock that records its owner thread
///
/// The exclusive owner is published as the wait point's provider so a thread
/// blocking on this mutex can be traced to whoever holds it. Locking twice
/// from the same thread is a programming error and panics instead of hanging.
pub struct TrackedMutex<T> {
    inner: RwLock<T>,
    point: Arc<WaitPoint>,
    tracker: SharedTracker,
    shared_holders: Mutex<HashSet<ThreadId>>,
}

impl<T> TrackedMutex<T> {
    pub fn new(name: impl Into<String>, tracker: SharedTracker, value: T) -> Self {
        Self {
            inner: RwLock::new(value),
            point: WaitPoint::new(name),
            tracker,
            shared_holders: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.point.name()
    }

    /// Thread currently holding the exclusive lock
    pub fn owner(&self) -> Option<ThreadId> {
        self.point.provider()
    }

    /// Acquire the exclusive lock
    pub fn lock(&self) -> TrackedMutexGuard<'_, T> {
        let me = self.check_not_held();
        let guard = match self.inner.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let _scope = WaitScope::enter(&*self.tracker, &self.point);
                self.inner.write().unwrap_or_else(PoisonError::into_inner)
            }
        };
        self.point.set_provider(Some(me));
        TrackedMutexGuard {
            mutex: self,
            guard: Some(guard),
        }
    }

    /// Acquire the exclusive lock only if it is free
    pub fn try_lock(&self) -> Option<TrackedMutexGuard<'_, T>> {
        let me = self.check_not_held();
        let guard = match self.inner.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        self.point.set_provider(Some(me));
        Some(TrackedMutexGuard {
            mutex: self,
            guard: Some(guard),
        })
    }

    /// Acquire the lock in shared mode
    pub fn lock_shared(&self) -> TrackedSharedGuard<'_, T> {
        let me = self.check_not_held();
        let guard = match self.inner.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let _scope = WaitScope::enter(&*self.tracker, &self.point);
                self.inner.read().unwrap_or_else(PoisonError::into_inner)
            }
        };
        self.holders().insert(me);
        TrackedSharedGuard {
            mutex: self,
            guard: Some(guard),
        }
    }

    fn holders(&self) -> std::sync::MutexGuard<'_, HashSet<ThreadId>> {
        self.shared_holders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_not_held(&self) -> ThreadId {
        let me = thread::current().id();
        assert!(
            self.point.provider() != Some(me),
            "{}: recursive lock of a non-recursive mutex",
            self.point.name()
        );
        assert!(
            !self.holders().contains(&me),
            "{}: lock requested while holding it shared",
            self.point.name()
        );
        me
    }
}

/// Exclusive guard; releasing clears the owner record
pub struct TrackedMutexGuard<'a, T> {
    mutex: &'a TrackedMutex<T>,
    guard: Option<RwLockWriteGuard<'a, T>>,
}

impl<'a, T> TrackedMutexGuard<'a, T> {
    /// Release the lock, run `f`, then reacquire
    pub fn unlocked<R>(guard: Self, f: impl FnOnce() -> R) -> (Self, R) {
        let mutex = guard.mutex;
        drop(guard);
        let result = f();
        (mutex.lock(), result)
    }

    pub fn mutex(guard: &Self) -> &'a TrackedMutex<T> {
        guard.mutex
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Owner record must be cleared before another thread can acquire
        self.mutex.point.set_provider(None);
        self.guard.take();
    }
}

/// Shared guard
pub struct TrackedSharedGuard<'a, T> {
    mutex: &'a TrackedMutex<T>,
    guard: Option<RwLockReadGuard<'a, T>>,
}

impl<T> Deref for TrackedSharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<T> Drop for TrackedSharedGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.holders().remove(&thread::current().id());
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tracker::NoopTracker;
    use std::sync::Arc;

    fn mutex(value: i32) -> TrackedMutex<i32> {
        TrackedMutex::new("test-mutex", Arc::new(NoopTracker), value)
    }

    #[test]
    fn test_lock_records_owner() {
        let m = mutex(1);
        assert_eq!(m.owner(), None);
        {
            let mut guard = m.lock();
            *guard += 1;
            assert_eq!(m.owner(), Some(thread::current().id()));
        }
        assert_eq!(m.owner(), None);
        assert_eq!(*m.lock_shared(), 2);
    }

    #[test]
    fn test_try_lock_fails_while_held_elsewhere() {
        let m = Arc::new(mutex(0));
        let guard = m.lock();
        let m2 = Arc::clone(&m);
        let got = thread::spawn(move || m2.try_lock().is_some()).join().unwrap();
        assert!(!got);
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    #[should_panic(expected = "recursive lock")]
    fn test_recursive_lock_panics() {
        let m = mutex(0);
        let _a = m.lock();
        let _b = m.lock();
    }

    #[test]
    fn test_unlocked_releases_and_reacquires() {
        let m = Arc::new(mutex(5));
        let guard = m.lock();
        let m2 = Arc::clone(&m);
        let (guard, seen) = TrackedMutexGuard::unlocked(guard, move || {
            thread::spawn(move || *m2.lock_shared()).join().unwrap()
        });
        assert_eq!(seen, 5);
        assert_eq!(*guard, 5);
    }

    #[test]
    fn test_concurrent_increments() {
        let m = Arc::new(mutex(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..100 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock_shared(), 400);
    }
}
