//! Task runner ordering, cancellation and shutdown tests

use frameline_common::{Error, ManualClock, SyncContext, TaskPriority, TaskRunner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: &'static str) -> impl FnOnce() + Send + 'static {
    let log = Arc::clone(log);
    move || log.lock().unwrap().push(entry)
}

/// Occupy the worker until the returned sender is used (or dropped)
fn block_worker(runner: &TaskRunner) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    runner.add_internal_task(TaskPriority::Immediate, "gate", move || {
        started_tx.send(()).unwrap();
        let _ = release_rx.recv();
    });
    started_rx.recv().unwrap();
    release_tx
}

#[test]
fn test_equal_delay_timers_fire_in_registration_order() {
    let clock = ManualClock::shared();
    let runner = TaskRunner::new("order", &SyncContext::with_clock(clock.clone())).unwrap();
    let order = log();

    runner.add_timer(Duration::from_millis(100), push(&order, "first"));
    runner.add_timer(Duration::from_millis(100), push(&order, "second"));
    runner.add_timer(Duration::from_millis(50), push(&order, "earliest"));

    clock.advance(Duration::from_millis(200));
    runner.wait_until_finished();

    assert_eq!(*order.lock().unwrap(), vec!["earliest", "first", "second"]);
    runner.stop();
}

#[test]
fn test_internal_task_runs_before_ready_timer() {
    let runner = TaskRunner::new("priority", &SyncContext::new()).unwrap();
    let order = log();

    let gate = block_worker(&runner);
    runner.add_timer(Duration::ZERO, push(&order, "timer"));
    runner.add_internal_task(TaskPriority::Internal, "internal", push(&order, "internal"));
    gate.send(()).unwrap();

    runner.wait_until_finished();
    assert_eq!(*order.lock().unwrap(), vec!["internal", "timer"]);
    runner.stop();
}

#[test]
fn test_tiers_run_highest_first() {
    let runner = TaskRunner::new("tiers", &SyncContext::new()).unwrap();
    let order = log();

    let gate = block_worker(&runner);
    runner.add_internal_task(TaskPriority::Internal, "a", push(&order, "internal-1"));
    runner.add_internal_task(TaskPriority::Events, "b", push(&order, "events"));
    runner.add_internal_task(TaskPriority::Internal, "c", push(&order, "internal-2"));
    runner.add_internal_task(TaskPriority::Immediate, "d", push(&order, "immediate"));
    gate.send(()).unwrap();

    runner.wait_until_finished();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["immediate", "events", "internal-1", "internal-2"]
    );
    runner.stop();
}

#[test]
fn test_repeated_timer_until_cancelled() {
    let runner = TaskRunner::new("repeat", &SyncContext::new()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let id = runner.add_repeated_timer(Duration::from_millis(1), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    while count.load(Ordering::SeqCst) < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    // Repeating timers are not pending work
    assert!(!runner.has_pending_work());

    runner.cancel_timer(id);
    // Let a run that was already in flight finish
    runner
        .add_internal_task(TaskPriority::Internal, "sync", || ())
        .wait()
        .unwrap();
    let after_cancel = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    runner.stop();
}

#[test]
fn test_cancel_pending_one_shot_timer() {
    let clock = ManualClock::shared();
    let runner = TaskRunner::new("cancel", &SyncContext::with_clock(clock.clone())).unwrap();
    let order = log();

    let id = runner.add_timer(Duration::from_secs(5), push(&order, "cancelled"));
    runner.add_timer(Duration::from_secs(5), push(&order, "kept"));
    runner.cancel_timer(id);

    clock.advance(Duration::from_secs(5));
    runner.wait_until_finished();
    assert_eq!(*order.lock().unwrap(), vec!["kept"]);
    runner.stop();
}

#[test]
fn test_belongs_to_current_thread() {
    let runner = Arc::new(TaskRunner::new("owner", &SyncContext::new()).unwrap());
    assert!(!runner.belongs_to_current_thread());

    let inner = Arc::clone(&runner);
    let on_worker = runner
        .add_internal_task(TaskPriority::Internal, "probe", move || {
            inner.belongs_to_current_thread()
        })
        .wait()
        .unwrap();
    assert!(on_worker);
    runner.stop();
}

#[test]
fn test_stop_cancels_unrun_tasks() {
    let runner = TaskRunner::new("shutdown", &SyncContext::new()).unwrap();
    let gate = block_worker(&runner);
    let handle = runner.add_internal_task(TaskPriority::Internal, "never", || 1);

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        gate.send(()).unwrap();
    });
    runner.stop();
    releaser.join().unwrap();

    assert!(handle.is_done());
    assert!(matches!(handle.wait(), Err(Error::Cancelled(_))));
    assert!(!runner.is_running());
}

#[test]
fn test_task_added_after_stop_is_cancelled() {
    let runner = TaskRunner::new("late", &SyncContext::new()).unwrap();
    runner.stop();
    runner.stop();

    let handle = runner.add_internal_task(TaskPriority::Events, "late", || "x");
    assert!(matches!(handle.wait(), Err(Error::Cancelled(_))));
    // Must not hang once stopped
    runner.wait_until_finished();
}

#[test]
fn test_wait_until_finished_drains_queue() {
    let runner = TaskRunner::new("drain", &SyncContext::new()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let counter = Arc::clone(&count);
        runner.add_internal_task(TaskPriority::Internal, "inc", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    runner.wait_until_finished();
    assert_eq!(count.load(Ordering::SeqCst), 50);
    assert!(!runner.has_pending_work());
    runner.stop();
}
