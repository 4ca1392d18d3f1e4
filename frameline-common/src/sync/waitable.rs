//! Wait points: the graph nodes shared between a primitive and the tracker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;

/// Identity and provider record of one synchronization object
///
/// A mutex records its current owner as provider; an event records the thread
/// that will signal it. `resolved` is set while an event holds a value so the
/// tracker can ignore waiters that are about to wake.
#[derive(Debug)]
pub struct WaitPoint {
    name: String,
    provider: Mutex<Option<ThreadId>>,
    resolved: AtomicBool,
}

impl WaitPoint {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            provider: Mutex::new(None),
            resolved: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> Option<ThreadId> {
        *self.provider.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_provider(&self, provider: Option<ThreadId>) {
        *self.provider.lock().unwrap_or_else(PoisonError::into_inner) = provider;
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub(crate) fn set_resolved(&self, resolved: bool) {
        self.resolved.store(resolved, Ordering::Release);
    }
}
