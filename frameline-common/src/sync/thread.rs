//! Named OS threads registered with the wait tracker

use super::tracker::SharedTracker;
use crate::error::Result;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};

/// Handle to a thread spawned through [`TrackedThread::spawn`]
///
/// Like [`JoinHandle`], dropping the handle detaches the thread. Owners stop
/// the body and call [`TrackedThread::join`] from their own `Drop`.
pub struct TrackedThread {
    name: String,
    id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl TrackedThread {
    /// Spawn `body` on a named thread that reports its lifetime to `tracker`
    pub fn spawn<F>(name: &str, tracker: SharedTracker, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let me = thread::current().id();
                tracker.register_thread(me, &thread_name);
                debug!("Thread {} started", thread_name);
                body();
                tracker.thread_exiting(me);
                debug!("Thread {} exiting", thread_name);
            })?;
        Ok(Self {
            name: name.to_string(),
            id: handle.thread().id(),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the thread to exit; joining from the thread itself is skipped
    pub fn join(&mut self) {
        if self.is_current() {
            warn!("Thread {} asked to join itself", self.name);
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Thread {} panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tracker::NoopTracker;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_and_join() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut t = TrackedThread::spawn("worker", Arc::new(NoopTracker), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(t.name(), "worker");
        assert!(!t.is_current());
        t.join();
        assert!(ran.load(Ordering::SeqCst));
        assert!(t.is_finished());
    }

    #[test]
    fn test_drop_detaches() {
        let release = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (r, d) = (Arc::clone(&release), Arc::clone(&done));
        let t = TrackedThread::spawn("detached", Arc::new(NoopTracker), move || {
            while !r.load(Ordering::SeqCst) {
                thread::sleep(std::time::Duration::from_millis(1));
            }
            d.store(true, Ordering::SeqCst);
        })
        .unwrap();
        // Dropping must not wait for the body
        drop(t);
        release.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !done.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "detached thread never finished");
            thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
