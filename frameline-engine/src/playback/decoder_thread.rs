//! Decode worker
//!
//! Pulls encoded frames from an [`ElementaryStream`], decodes them and pushes
//! the output into a [`DecodedStream`], staying a fixed amount ahead of the
//! playhead. After a seek it restarts from the keyframe at or before the new
//! time. The thread registers itself as a [`PipelineClient`] so pipeline seeks
//! reach it without extra wiring.

use super::pipeline_manager::PipelineManager;
use crate::error::{MediaError, MediaResult};
use crate::media::{
    buffered_ahead, ClientId, DecodedStream, Decoder, Decryptor, ElementaryStream, Frame,
    FrameLocation, PipelineClient,
};
use frameline_common::sync::{ThreadEvent, TrackedMutex, TrackedThread};
use frameline_common::{PipelineConfig, SharedClock, SyncContext};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Notifications raised from the decode thread
pub struct DecoderCallbacks {
    /// The first frame at or after a seek target was decoded
    pub seek_done: Box<dyn Fn() + Send + Sync>,
    /// A frame needs a key that is not available yet
    pub waiting_for_key: Box<dyn Fn() + Send + Sync>,
    /// Decoding failed; the thread has stopped
    pub on_error: Box<dyn Fn(MediaError) + Send + Sync>,
}

impl Default for DecoderCallbacks {
    fn default() -> Self {
        Self {
            seek_done: Box::new(|| ()),
            waiting_for_key: Box::new(|| ()),
            on_error: Box::new(|_| ()),
        }
    }
}

#[derive(Default)]
struct Inputs {
    input: Option<Arc<ElementaryStream>>,
    output: Option<Arc<DecodedStream>>,
    decoder: Option<Box<dyn Decoder>>,
    /// Bumped on every `set_decoder` so a leased decoder is not put back over a new one
    decoder_generation: u64,
    decryptor: Option<Arc<dyn Decryptor>>,
}

struct Shared {
    pipeline: Arc<PipelineManager>,
    clock: SharedClock,
    config: PipelineConfig,
    callbacks: DecoderCallbacks,
    inputs: TrackedMutex<Inputs>,
    /// Wakes the loop while it is parked for lack of inputs
    attached: ThreadEvent<()>,
    shutdown: AtomicBool,
    is_seeking: AtomicBool,
    did_flush: AtomicBool,
    /// DTS of the last decoded frame as f64 bits; NaN after a seek
    last_frame_time: AtomicU64,
    /// Bumped by every seek; output decoded across a seek is discarded
    seek_generation: AtomicU64,
}

/// Everything one loop iteration works with
struct Work<'a> {
    shared: &'a Shared,
    input: Arc<ElementaryStream>,
    output: Arc<DecodedStream>,
    decoder: Option<Box<dyn Decoder>>,
    generation: u64,
    decryptor: Option<Arc<dyn Decryptor>>,
}

impl Drop for Work<'_> {
    fn drop(&mut self) {
        let Some(decoder) = self.decoder.take() else {
            return;
        };
        let mut inputs = self.shared.inputs.lock();
        if inputs.decoder_generation == self.generation && inputs.decoder.is_none() {
            inputs.decoder = Some(decoder);
        }
    }
}

impl Shared {
    fn last_frame_time(&self) -> f64 {
        f64::from_bits(self.last_frame_time.load(Ordering::Acquire))
    }

    /// Lease the inputs, or park until something is attached
    fn acquire(&self) -> Option<Work<'_>> {
        let mut inputs = self.inputs.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let ready = inputs.input.is_some() && inputs.output.is_some() && inputs.decoder.is_some();
        if !ready {
            trace!("Decoder parked until attached");
            let (_inputs, _) = self.attached.reset_and_wait_while_unlocked(inputs);
            return None;
        }
        Some(Work {
            shared: self,
            input: Arc::clone(inputs.input.as_ref()?),
            output: Arc::clone(inputs.output.as_ref()?),
            decoder: inputs.decoder.take(),
            generation: inputs.decoder_generation,
            decryptor: inputs.decryptor.clone(),
        })
    }

    /// Reset the cursor and drop decoded output
    ///
    /// Runs under the exclusive inputs lock, which excludes the loop's
    /// check-and-add of decoded frames. The generation is bumped last: a loop
    /// iteration that loads the new generation also sees the reset cursor.
    fn on_seek(&self) {
        let inputs = self.inputs.lock();
        self.last_frame_time.store(f64::NAN.to_bits(), Ordering::Release);
        self.is_seeking.store(true, Ordering::Release);
        self.did_flush.store(false, Ordering::Release);
        if let Some(output) = &inputs.output {
            output.clear();
        }
        self.seek_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn run(&self) {
        info!("Decoder thread started");
        let mut raised_waiting_event = false;

        while !self.shutdown.load(Ordering::Acquire) {
            let Some(mut work) = self.acquire() else {
                continue;
            };
            let generation = self.seek_generation.load(Ordering::Acquire);
            let cur_time = self.pipeline.current_time();
            let last_time = self.last_frame_time();

            if buffered_ahead(&work.output.get_buffered_ranges(), cur_time) > self.config.decode_buffer_ahead {
                drop(work);
                self.clock.sleep(self.config.no_data_backoff());
                continue;
            }

            let evict_before = cur_time - self.config.eviction_behind;
            if evict_before > 0.0 {
                work.output.remove(f64::NEG_INFINITY, evict_before);
            }

            let Some(decoder) = work.decoder.as_mut() else {
                continue;
            };
            let frame = if last_time.is_nan() {
                decoder.reset_decoder();
                work.input.get_frame(cur_time, FrameLocation::KeyFrameBefore)
            } else {
                work.input.get_frame(last_time, FrameLocation::After)
            };

            if frame.is_none() {
                let at_end = !last_time.is_nan()
                    && self
                        .pipeline
                        .duration()
                        .map_or(false, |d| last_time + self.config.end_delta >= d);
                if !at_end || self.did_flush.swap(true, Ordering::AcqRel) {
                    drop(work);
                    self.clock.sleep(self.config.no_data_backoff());
                    continue;
                }
                debug!("Reached the end of the stream; flushing decoder");
            }

            let result = decoder.decode(frame.as_deref(), work.decryptor.as_deref());
            let decoded = match result {
                Ok(decoded) => decoded,
                Err(err) if err.is_recoverable() => {
                    if !raised_waiting_event {
                        raised_waiting_event = true;
                        warn!("Decoder waiting for key: {}", err);
                        (self.callbacks.waiting_for_key)();
                    }
                    drop(work);
                    self.clock.sleep(self.config.missing_key_backoff());
                    continue;
                }
                Err(err) => {
                    error!("Decoder error: {}", err);
                    drop(work);
                    (self.callbacks.on_error)(err);
                    break;
                }
            };
            raised_waiting_event = false;

            let last_pts = decoded.last().map_or(-1.0, |f| f.pts());
            {
                let _inputs = self.inputs.lock_shared();
                if self.seek_generation.load(Ordering::Acquire) != generation {
                    trace!("Discarding {} frames decoded across a seek", decoded.len());
                    continue;
                }
                for decoded_frame in decoded {
                    work.output.add_frame(decoded_frame);
                }
            }

            if let Some(frame) = frame {
                // Keep the reset cursor if a seek happened while decoding
                let updated = self
                    .last_frame_time
                    .compare_exchange(
                        last_time.to_bits(),
                        frame.dts().to_bits(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if updated
                    && last_pts >= cur_time
                    && self
                        .is_seeking
                        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    debug!("Seek done at {:.3}", last_pts);
                    (self.callbacks.seek_done)();
                }
            }
        }
        info!("Decoder thread exiting");
    }
}

impl PipelineClient for Shared {
    fn on_seeking(&self) {
        self.on_seek();
    }
}

/// Owns the decode thread
pub struct DecoderThread {
    shared: Arc<Shared>,
    thread: Option<TrackedThread>,
    client_id: Option<ClientId>,
}

impl DecoderThread {
    /// Spawn the decode thread; it parks until input, output and a decoder are set
    pub fn new(
        ctx: &SyncContext,
        config: &PipelineConfig,
        pipeline: Arc<PipelineManager>,
        callbacks: DecoderCallbacks,
    ) -> MediaResult<Self> {
        let shared = Arc::new(Shared {
            pipeline: Arc::clone(&pipeline),
            clock: Arc::clone(ctx.clock()),
            config: config.clone(),
            callbacks,
            inputs: TrackedMutex::new("DecoderInputs", Arc::clone(ctx.tracker()), Inputs::default()),
            attached: ThreadEvent::new("DecoderAttached", Arc::clone(ctx.tracker())),
            shutdown: AtomicBool::new(false),
            is_seeking: AtomicBool::new(false),
            did_flush: AtomicBool::new(false),
            last_frame_time: AtomicU64::new(f64::NAN.to_bits()),
            seek_generation: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = TrackedThread::spawn("Decoder", Arc::clone(ctx.tracker()), move || worker.run())?;
        let client_id = pipeline.add_client(Arc::clone(&shared) as Arc<dyn PipelineClient>);
        Ok(Self {
            shared,
            thread: Some(thread),
            client_id: Some(client_id),
        })
    }

    pub fn attach(&self, input: Arc<ElementaryStream>, output: Arc<DecodedStream>) {
        {
            let mut inputs = self.shared.inputs.lock();
            inputs.input = Some(input);
            inputs.output = Some(output);
        }
        self.shared.attached.signal(());
    }

    pub fn detach(&self) {
        let mut inputs = self.shared.inputs.lock();
        inputs.input = None;
        inputs.output = None;
    }

    /// Replace the decoder; `None` parks the thread
    pub fn set_decoder(&self, decoder: Option<Box<dyn Decoder>>) {
        {
            let mut inputs = self.shared.inputs.lock();
            inputs.decoder = decoder;
            inputs.decoder_generation += 1;
        }
        self.shared.attached.signal(());
    }

    pub fn set_decryptor(&self, decryptor: Option<Arc<dyn Decryptor>>) {
        self.shared.inputs.lock().decryptor = decryptor;
    }

    /// Restart decoding from the pipeline's current time
    ///
    /// Drops everything already decoded. Called automatically on pipeline seeks.
    pub fn on_seek(&self) {
        self.shared.on_seek();
    }

    /// Stop the loop and join the thread; in-flight decodes complete first
    pub fn stop(&mut self) {
        if let Some(id) = self.client_id.take() {
            self.shared.pipeline.remove_client(id);
        }
        {
            let _inputs = self.shared.inputs.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.attached.signal(());
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
    }
}

impl Drop for DecoderThread {
    fn drop(&mut self) {
        self.stop();
    }
}
