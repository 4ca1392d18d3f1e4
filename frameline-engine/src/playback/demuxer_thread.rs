//! Demux worker
//!
//! Appended container segments are queued and demuxed on a dedicated thread.
//! Frames outside the append window are dropped, and after any dropped frame
//! the stream resumes only at the next keyframe. Completion callbacks run on
//! the task runner when one is supplied, otherwise on the demux thread.

use super::pipeline_manager::PipelineManager;
use crate::error::{MediaError, MediaResult};
use crate::media::{buffered_ahead, Demuxer, ElementaryStream, Frame};
use frameline_common::sync::{ThreadEvent, TrackedMutex, TrackedThread};
use frameline_common::{PipelineConfig, SharedClock, SyncContext, TaskPriority, TaskRunner};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Receives the outcome of one `append_data` call
pub type AppendCallback = Box<dyn FnOnce(bool) + Send + Sync>;

/// Called when demuxing fails; the thread has stopped
pub type DemuxErrorCallback = Box<dyn Fn(MediaError) + Send + Sync>;

/// One queued segment
struct Append {
    data: Vec<u8>,
    timestamp_offset: f64,
    window_start: f64,
    window_end: f64,
    on_complete: AppendCallback,
}

struct State {
    demuxer: Option<Box<dyn Demuxer>>,
    queue: VecDeque<Append>,
    /// Drop frames until a keyframe (start of stream or after a gap)
    need_key_frame: bool,
}

struct Shared {
    name: String,
    pipeline: Arc<PipelineManager>,
    output: Arc<ElementaryStream>,
    runner: Option<Arc<TaskRunner>>,
    on_error: DemuxErrorCallback,
    clock: SharedClock,
    config: PipelineConfig,
    state: TrackedMutex<State>,
    new_data: ThreadEvent<()>,
    shutdown: AtomicBool,
}

impl Shared {
    fn complete(&self, on_complete: AppendCallback, success: bool) {
        match &self.runner {
            Some(runner) => {
                runner.add_internal_task(TaskPriority::Internal, "Append done", move || {
                    on_complete(success)
                });
            }
            None => on_complete(success),
        }
    }

    fn run(&self) {
        info!("{} demuxer started", self.name);
        while !self.shutdown.load(Ordering::Acquire) {
            let time = self.pipeline.current_time();
            let ahead = buffered_ahead(&self.output.get_buffered_ranges(), time);

            let mut state = self.state.lock();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if state.queue.is_empty() {
                let (_state, woken) = self.new_data.reset_and_wait_while_unlocked(state);
                if let Err(err) = woken {
                    trace!("{} demuxer wait ended without data: {}", self.name, err);
                }
                continue;
            }
            if ahead > self.config.demux_buffer_ahead {
                drop(state);
                trace!("{} demuxer throttled, {:.1}s ahead", self.name, ahead);
                self.clock.sleep(self.config.no_data_backoff());
                continue;
            }
            let Some(append) = state.queue.pop_front() else {
                continue;
            };

            if state.demuxer.is_none() {
                drop(state);
                error!("{} demuxer: data appended without a demuxer", self.name);
                self.complete(append.on_complete, false);
                continue;
            }

            let result = match state.demuxer.as_mut() {
                Some(demuxer) => demuxer.demux(append.timestamp_offset, &append.data),
                None => continue,
            };
            let frames = match result {
                Ok(frames) => frames,
                Err(err) => {
                    let pending: Vec<Append> = state.queue.drain(..).collect();
                    drop(state);
                    error!("{} demuxer failed: {}", self.name, err);
                    self.complete(append.on_complete, false);
                    for queued in pending {
                        self.complete(queued.on_complete, false);
                    }
                    (self.on_error)(err);
                    break;
                }
            };

            let mut added = 0;
            for frame in frames {
                if frame.pts() < append.window_start
                    || frame.pts() + frame.duration() > append.window_end
                {
                    state.need_key_frame = true;
                    trace!("Dropping frame outside append window, pts={:.3}", frame.pts());
                    continue;
                }
                if state.need_key_frame {
                    if !frame.is_key_frame() {
                        trace!("Dropping frame while looking for key frame, pts={:.3}", frame.pts());
                        continue;
                    }
                    state.need_key_frame = false;
                }
                self.output.add_frame(frame);
                added += 1;
            }
            drop(state);

            debug!("{} demuxer added {} frames", self.name, added);
            self.complete(append.on_complete, true);
        }
        info!("{} demuxer exiting", self.name);
    }
}

/// Owns one demux thread feeding one elementary stream
pub struct DemuxerThread {
    shared: Arc<Shared>,
    thread: Option<TrackedThread>,
}

impl DemuxerThread {
    /// Spawn the demux thread for `output`
    ///
    /// `name` is used for the thread and in log lines (e.g. "mp4").
    pub fn new(
        ctx: &SyncContext,
        config: &PipelineConfig,
        name: &str,
        pipeline: Arc<PipelineManager>,
        output: Arc<ElementaryStream>,
        runner: Option<Arc<TaskRunner>>,
        on_error: DemuxErrorCallback,
    ) -> MediaResult<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            pipeline,
            output,
            runner,
            on_error,
            clock: Arc::clone(ctx.clock()),
            config: config.clone(),
            state: TrackedMutex::new(
                format!("{} demuxer", name),
                Arc::clone(ctx.tracker()),
                State {
                    demuxer: None,
                    queue: VecDeque::new(),
                    need_key_frame: true,
                },
            ),
            new_data: ThreadEvent::new(format!("{} new data", name), Arc::clone(ctx.tracker())),
            shutdown: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let thread = TrackedThread::spawn(&format!("{} demuxer", name), Arc::clone(ctx.tracker()), move || {
            worker.run()
        })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Replace the demuxer; frames resume at the next keyframe
    pub fn set_demuxer(&self, demuxer: Option<Box<dyn Demuxer>>) {
        let mut state = self.shared.state.lock();
        state.demuxer = demuxer;
        state.need_key_frame = true;
    }

    /// Queue a segment for demuxing
    ///
    /// Frames are shifted by `timestamp_offset`; frames not fully inside
    /// `[window_start, window_end]` are dropped. `on_complete` receives false
    /// if the segment could not be demuxed.
    pub fn append_data(
        &self,
        timestamp_offset: f64,
        window_start: f64,
        window_end: f64,
        data: Vec<u8>,
        on_complete: AppendCallback,
    ) {
        let mut state = self.shared.state.lock();
        if state.demuxer.is_none() || self.shared.shutdown.load(Ordering::Acquire) {
            drop(state);
            error!("{} demuxer: append_data called without a running demuxer", self.shared.name);
            self.shared.complete(on_complete, false);
            return;
        }
        state.queue.push_back(Append {
            data,
            timestamp_offset,
            window_start,
            window_end,
            on_complete,
        });
        drop(state);
        self.shared.new_data.signal(());
    }

    /// Drop queued segments and demuxer state; the next frame must be a keyframe
    pub fn reset(&self) {
        let pending: Vec<Append> = {
            let mut state = self.shared.state.lock();
            if let Some(demuxer) = state.demuxer.as_mut() {
                demuxer.reset();
            }
            state.need_key_frame = true;
            state.queue.drain(..).collect()
        };
        for append in pending {
            self.shared.complete(append.on_complete, false);
        }
    }

    /// Stop the loop and join the thread; a segment being demuxed completes first
    pub fn stop(&mut self) {
        {
            let _state = self.shared.state.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.new_data.signal(());
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
        let pending: Vec<Append> = self.shared.state.lock().queue.drain(..).collect();
        for append in pending {
            self.shared.complete(append.on_complete, false);
        }
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        self.stop();
    }
}
