//! Priority task scheduler
//!
//! One dedicated worker thread drains a queue of one-shot tasks and timers.
//! Selection rules:
//! - any ready non-timer task beats every timer; the highest tier wins and
//!   within a tier the earliest-added task runs first
//! - a timer is ready once `start + delay` has passed; among ready timers the
//!   earliest fire time runs first, ties broken by registration order
//!
//! Tasks are created on any thread but run and are dropped on the worker.
//! When the runner stops, tasks that never ran are dropped without running and
//! their handles resolve as cancelled.

use crate::clock::SharedClock;
use crate::context::SyncContext;
use crate::error::{Error, Result};
use crate::sync::{SharedTracker, ThreadEvent, TrackedThread};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Identifier returned for every scheduled task
pub type TaskId = u64;

/// Longest the worker sleeps while timers are pending, so time sources that
/// jump (test clocks) are noticed promptly
const MAX_IDLE_WAIT: Duration = Duration::from_millis(5);

/// Priority tiers, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Delayed callbacks; only run when no other work is ready
    Timer,
    /// Engine-internal work
    Internal,
    /// Event dispatch to the embedding application
    Events,
    /// Must run before anything else
    Immediate,
}

trait TaskBody: Send {
    fn run(&mut self);
}

struct OnceBody<F>(Option<F>);

impl<F: FnOnce() + Send> TaskBody for OnceBody<F> {
    fn run(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

struct RepeatBody<F>(F);

impl<F: FnMut() + Send> TaskBody for RepeatBody<F> {
    fn run(&mut self) {
        (self.0)();
    }
}

/// Task whose return value resolves a handle; dropping it unrun abandons
/// the handle
struct ResultBody<F, R: Clone> {
    f: Option<F>,
    event: Arc<ThreadEvent<R>>,
}

impl<F, R> TaskBody for ResultBody<F, R>
where
    F: FnOnce() -> R + Send,
    R: Clone + Send,
{
    fn run(&mut self) {
        if let Some(f) = self.f.take() {
            self.event.signal(f());
        }
    }
}

impl<F, R: Clone> Drop for ResultBody<F, R> {
    fn drop(&mut self) {
        if self.f.is_some() {
            self.event.abandon();
        }
    }
}

struct PendingTask {
    id: TaskId,
    priority: TaskPriority,
    name: String,
    start: Duration,
    delay: Duration,
    repeat: bool,
    body: Box<dyn TaskBody>,
}

impl PendingTask {
    fn fire_time(&self) -> Duration {
        self.start + self.delay
    }

    /// True if `self` should run before `other` (both ready)
    fn runs_before(&self, other: &PendingTask) -> bool {
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        if self.priority == TaskPriority::Timer {
            return (self.fire_time(), self.id) < (other.fire_time(), other.id);
        }
        self.id < other.id
    }
}

struct RunningTask {
    id: TaskId,
    repeat: bool,
    cancelled: bool,
}

#[derive(Default)]
struct Queue {
    tasks: Vec<PendingTask>,
    next_id: TaskId,
    running: Option<RunningTask>,
}

impl Queue {
    fn has_pending_work(&self) -> bool {
        self.tasks.iter().any(|t| !t.repeat)
            || self.running.as_ref().map_or(false, |r| !r.repeat)
    }

    /// Remove and return the task that should run now
    fn take_next(&mut self, now: Duration) -> Option<PendingTask> {
        let mut best: Option<usize> = None;
        for (i, task) in self.tasks.iter().enumerate() {
            if task.priority == TaskPriority::Timer && task.fire_time() > now {
                continue;
            }
            best = match best {
                Some(b) if !task.runs_before(&self.tasks[b]) => Some(b),
                _ => Some(i),
            };
        }
        let task = self.tasks.remove(best?);
        self.running = Some(RunningTask {
            id: task.id,
            repeat: task.repeat,
            cancelled: false,
        });
        Some(task)
    }

    /// Time until the earliest timer fires
    fn next_timer_in(&self, now: Duration) -> Option<Duration> {
        self.tasks
            .iter()
            .map(|t| t.fire_time().saturating_sub(now))
            .min()
    }
}

struct Shared {
    name: String,
    queue: Mutex<Queue>,
    cond: Condvar,
    running: AtomicBool,
    clock: SharedClock,
    idle: ThreadEvent<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the result of an internal task
pub struct TaskHandle<R> {
    id: TaskId,
    event: Arc<ThreadEvent<R>>,
}

impl<R: Clone> TaskHandle<R> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the task ran or was cancelled
    pub fn is_done(&self) -> bool {
        self.event.is_resolved()
    }

    /// Block until the task ran; `Error::Cancelled` if it was dropped unrun
    pub fn wait(&self) -> Result<R> {
        self.event.wait().map_err(|e| self.cancelled(e))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<R> {
        self.event.wait_timeout(timeout).map_err(|e| self.cancelled(e))
    }

    fn cancelled(&self, error: Error) -> Error {
        match error {
            Error::Abandoned(name) => Error::Cancelled(name),
            other => other,
        }
    }
}

/// Single-threaded priority scheduler
pub struct TaskRunner {
    shared: Arc<Shared>,
    tracker: SharedTracker,
    worker: Mutex<Option<TrackedThread>>,
    worker_id: ThreadId,
}

impl TaskRunner {
    /// Start the worker thread
    pub fn new(name: &str, ctx: &SyncContext) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue: Mutex::new(Queue::default()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            clock: Arc::clone(ctx.clock()),
            idle: ThreadEvent::new(format!("{}:idle", name), Arc::clone(ctx.tracker())),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = TrackedThread::spawn(name, Arc::clone(ctx.tracker()), move || {
            run_worker(&worker_shared);
        })?;
        let worker_id = worker.id();
        shared.idle.set_provider(worker_id);

        info!("Task runner {} started", name);
        Ok(Self {
            shared,
            tracker: Arc::clone(ctx.tracker()),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Run `f` once after `delay`
    pub fn add_timer<F>(&self, delay: Duration, f: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(TaskPriority::Timer, "timer", delay, false, Box::new(OnceBody(Some(f))))
    }

    /// Run `f` every `delay`, measured from the end of the previous run
    pub fn add_repeated_timer<F>(&self, delay: Duration, f: F) -> TaskId
    where
        F: FnMut() + Send + 'static,
    {
        self.enqueue(TaskPriority::Timer, "repeated timer", delay, true, Box::new(RepeatBody(f)))
    }

    /// Remove a pending timer; a repeating timer that is currently running
    /// will not be rescheduled
    pub fn cancel_timer(&self, id: TaskId) {
        let removed = {
            let mut queue = self.shared.lock();
            if let Some(running) = queue.running.as_mut().filter(|r| r.id == id) {
                running.cancelled = true;
            }
            queue
                .tasks
                .iter()
                .position(|t| t.id == id)
                .map(|pos| queue.tasks.remove(pos))
        };
        if let Some(task) = removed {
            trace!("Cancelled task {} ({})", task.id, task.name);
        }
    }

    /// Queue `f` at `priority`; the handle resolves with its return value
    pub fn add_internal_task<F, R>(&self, priority: TaskPriority, name: &str, f: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        let priority = if priority == TaskPriority::Timer {
            error!("Internal task {} queued at timer priority; using Internal", name);
            TaskPriority::Internal
        } else {
            priority
        };

        let event = Arc::new(ThreadEvent::new(format!("task:{}", name), Arc::clone(&self.tracker)));
        event.set_provider(self.worker_id);
        let body = ResultBody {
            f: Some(f),
            event: Arc::clone(&event),
        };
        let id = self.enqueue(priority, name, Duration::ZERO, false, Box::new(body));
        TaskHandle { id, event }
    }

    /// True while any one-shot task (including one currently running) is queued
    pub fn has_pending_work(&self) -> bool {
        self.shared.lock().has_pending_work()
    }

    pub fn belongs_to_current_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Block until no one-shot work is pending
    pub fn wait_until_finished(&self) {
        if self.belongs_to_current_thread() {
            error!("wait_until_finished called from the {} worker", self.shared.name);
            return;
        }
        if !self.is_running() {
            return;
        }
        self.shared.idle.reset();
        if self.has_pending_work() && self.is_running() {
            if let Err(err) = self.shared.idle.wait() {
                debug!("{} stopped before going idle: {}", self.shared.name, err);
            }
        }
    }

    /// Stop the worker; un-run tasks are dropped and their handles cancelled
    pub fn stop(&self) {
        {
            let _queue = self.shared.lock();
            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }
            self.shared.cond.notify_all();
        }
        info!("Stopping task runner {}", self.shared.name);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut worker) = worker {
            worker.join();
        }
    }

    fn enqueue(
        &self,
        priority: TaskPriority,
        name: &str,
        delay: Duration,
        repeat: bool,
        body: Box<dyn TaskBody>,
    ) -> TaskId {
        let mut queue = self.shared.lock();
        let id = queue.next_id;
        queue.next_id += 1;
        if !self.is_running() {
            drop(queue);
            warn!("Task {} ({}) added after {} stopped; dropped", id, name, self.shared.name);
            drop(body);
            return id;
        }
        queue.tasks.push(PendingTask {
            id,
            priority,
            name: name.to_string(),
            start: self.shared.clock.now(),
            delay,
            repeat,
            body,
        });
        self.shared.cond.notify_all();
        id
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: &Shared) {
    let mut queue = shared.lock();
    loop {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let now = shared.clock.now();
        let next = queue.take_next(now);
        match next {
            Some(mut task) => {
                drop(queue);
                trace!("Running task {} ({})", task.id, task.name);
                task.body.run();

                queue = shared.lock();
                let cancelled = queue.running.take().map_or(false, |r| r.cancelled);
                if task.repeat && !cancelled {
                    task.start = shared.clock.now();
                    queue.tasks.push(task);
                } else {
                    drop(queue);
                    drop(task);
                    queue = shared.lock();
                }
            }
            None => {
                if !queue.has_pending_work() {
                    shared.idle.signal(());
                }
                let next_timer = queue.next_timer_in(now);
                queue = match next_timer {
                    None => shared
                        .cond
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some(remaining) => {
                        let wait = remaining.clamp(Duration::from_micros(100), MAX_IDLE_WAIT);
                        shared
                            .cond
                            .wait_timeout(queue, wait)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                };
            }
        }
    }

    let dropped: Vec<PendingTask> = queue.tasks.drain(..).collect();
    drop(queue);
    if !dropped.is_empty() {
        debug!("{} dropping {} un-run tasks", shared.name, dropped.len());
    }
    drop(dropped);
    shared.idle.signal(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Timer < TaskPriority::Internal);
        assert!(TaskPriority::Internal < TaskPriority::Events);
        assert!(TaskPriority::Events < TaskPriority::Immediate);
    }

    #[test]
    fn test_internal_task_returns_value() {
        let runner = TaskRunner::new("test-runner", &SyncContext::new()).unwrap();
        let handle = runner.add_internal_task(TaskPriority::Internal, "answer", || 42);
        assert_eq!(handle.wait().unwrap(), 42);
        runner.stop();
    }

    #[test]
    fn test_timer_waits_for_clock() {
        let clock = ManualClock::shared();
        let ctx = SyncContext::with_clock(clock.clone());
        let runner = TaskRunner::new("timer-runner", &ctx).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        runner.add_timer(Duration::from_secs(1), move || flag.store(true, Ordering::SeqCst));

        thread::sleep(Duration::from_millis(30));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(runner.has_pending_work());

        clock.advance(Duration::from_secs(1));
        runner.wait_until_finished();
        assert!(fired.load(Ordering::SeqCst));
        runner.stop();
    }
}
