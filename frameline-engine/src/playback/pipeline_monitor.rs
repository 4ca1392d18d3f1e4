//! Pipeline monitor
//!
//! Background thread that polls the buffered ranges and drives the pipeline
//! between `Stalled`, `Playing` and `Ended`. It also derives the ready state
//! and reports it whenever it changes.

use super::pipeline_manager::PipelineManager;
use crate::error::MediaResult;
use crate::media::{is_buffered_until, BufferedRange, PlaybackState, ReadyState};
use frameline_common::sync::TrackedThread;
use frameline_common::{PipelineConfig, SharedClock, SyncContext};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Supplies buffered ranges (encoded or decoded)
pub type BufferedRangesFn = Box<dyn Fn() -> Vec<BufferedRange> + Send + Sync>;

/// Called with the new ready state whenever it changes
pub type ReadyStateCallback = Box<dyn Fn(ReadyState) + Send + Sync>;

#[derive(Debug, Default)]
struct Control {
    running: bool,
    shutdown: bool,
    /// Set while the loop is blocked waiting for `start()`
    parked: bool,
}

struct Shared {
    pipeline: Arc<PipelineManager>,
    get_buffered: BufferedRangesFn,
    get_decoded: BufferedRangesFn,
    on_ready_state_changed: ReadyStateCallback,
    clock: SharedClock,
    config: PipelineConfig,
    control: Mutex<Control>,
    cond: Condvar,
    ready_state: Mutex<ReadyState>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        info!("Pipeline monitor started");
        loop {
            {
                let mut control = self.control();
                while !control.running && !control.shutdown {
                    control.parked = true;
                    self.cond.notify_all();
                    control = self.cond.wait(control).unwrap_or_else(PoisonError::into_inner);
                }
                if control.shutdown {
                    control.parked = true;
                    self.cond.notify_all();
                    break;
                }
                control.parked = false;
            }

            self.poll_once();
            self.clock.sleep(self.config.monitor_poll());
        }
        info!("Pipeline monitor stopped");
    }

    fn poll_once(&self) {
        let buffered = (self.get_buffered)();
        let decoded = (self.get_decoded)();
        let time = self.pipeline.current_time();
        let duration = self.pipeline.duration();
        let delta = self.config.end_delta;

        let can_play = is_buffered_until(&buffered, time, time + self.config.need_for_play, duration, delta);

        if self.pipeline.playback_state() != PlaybackState::Initializing {
            if duration.map_or(false, |d| time >= d) {
                self.pipeline.on_ended();
            } else if can_play && is_buffered_until(&decoded, time, time, duration, delta) {
                // Only move the playhead once the current frame is decoded
                self.pipeline.can_play();
            } else {
                self.pipeline.buffering_started();
            }
        }

        let ready = if self.pipeline.playback_state() == PlaybackState::Initializing {
            ReadyState::HaveNothing
        } else if is_buffered_until(&buffered, time, time + self.config.need_for_enough, duration, delta) {
            ReadyState::HaveEnoughData
        } else if can_play {
            ReadyState::HaveFutureData
        } else if is_buffered_until(&buffered, time, time, duration, delta) {
            ReadyState::HaveCurrentData
        } else {
            ReadyState::HaveMetadata
        };
        self.change_ready_state(ready);
    }

    fn change_ready_state(&self, new: ReadyState) {
        {
            let mut current = self.ready_state.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == new {
                return;
            }
            debug!("Ready state {} -> {}", *current, new);
            *current = new;
        }
        (self.on_ready_state_changed)(new);
    }
}

/// Owns the monitor thread
pub struct PipelineMonitor {
    shared: Arc<Shared>,
    thread: Option<TrackedThread>,
}

impl PipelineMonitor {
    /// Spawn the monitor thread; it stays parked until [`PipelineMonitor::start`]
    pub fn new(
        ctx: &SyncContext,
        config: &PipelineConfig,
        pipeline: Arc<PipelineManager>,
        get_buffered: BufferedRangesFn,
        get_decoded: BufferedRangesFn,
        on_ready_state_changed: ReadyStateCallback,
    ) -> MediaResult<Self> {
        let shared = Arc::new(Shared {
            pipeline,
            get_buffered,
            get_decoded,
            on_ready_state_changed,
            clock: Arc::clone(ctx.clock()),
            config: config.clone(),
            control: Mutex::new(Control::default()),
            cond: Condvar::new(),
            ready_state: Mutex::new(ReadyState::HaveNothing),
        });
        let worker = Arc::clone(&shared);
        let thread = TrackedThread::spawn("PipelineMonitor", Arc::clone(ctx.tracker()), move || {
            worker.run()
        })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.shared.ready_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin polling; no effect if already running
    pub fn start(&self) {
        let mut control = self.shared.control();
        if !control.running && !control.shutdown {
            control.running = true;
            self.shared.cond.notify_all();
        }
    }

    /// Stop polling and wait for the loop to park
    pub fn stop(&self) {
        let mut control = self.shared.control();
        control.running = false;
        self.shared.cond.notify_all();
        if self.thread.as_ref().map_or(true, TrackedThread::is_current) {
            return;
        }
        while !control.parked && !control.shutdown {
            control = self.shared.cond.wait(control).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop the loop and join the thread
    pub fn shutdown(&mut self) {
        {
            let mut control = self.shared.control();
            control.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
    }
}

impl Drop for PipelineMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
