//! Audio renderer
//!
//! Feeds decoded audio frames into an [`AudioDevice`] on a dedicated thread
//! while keeping the device aligned with the player's media clock. The
//! renderer tracks a sync point `(sync_time, bytes_written)`: the media time
//! at which writing restarted and how many bytes were written since. When the
//! end of the written data drifts from the next frame's pts by more than the
//! sync limit, silence is inserted or leading bytes of the frame are skipped.

use crate::error::MediaResult;
use crate::media::{
    AudioDevice, ClientId, DecodedFrame, DecodedStream, Frame, FrameFormat, FrameLocation,
    PipelineClient, PlaybackState, PlayerClock,
};
use frameline_common::sync::{ThreadEvent, TrackedMutex, TrackedMutexGuard, TrackedThread};
use frameline_common::{PipelineConfig, SharedClock, SyncContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Largest single silence write
const SILENCE: [u8; 4096] = [0; 4096];

fn sample_size(frame: &DecodedFrame) -> usize {
    match frame.format() {
        FrameFormat::Audio(format) => format.bytes_per_sample(),
        FrameFormat::Video(_) => 0,
    }
}

/// Seconds of audio in `bytes` of interleaved data shaped like `frame`
fn bytes_to_seconds(frame: &DecodedFrame, bytes: usize) -> f64 {
    let info = frame.stream_info();
    let bytes_per_sample = sample_size(frame) * info.channel_count as usize;
    if bytes_per_sample == 0 || info.sample_rate == 0 {
        return 0.0;
    }
    (bytes / bytes_per_sample) as f64 / f64::from(info.sample_rate)
}

/// Byte adjustment needed before playing `next`
///
/// Positive: bytes to skip at the start of `next`. Negative: bytes of silence
/// to write first. Differences under `sync_limit` seconds are ignored.
pub fn sync_bytes(sync_time: f64, bytes_written: usize, next: &DecodedFrame, sync_limit: f64) -> i64 {
    let buffer_end = sync_time + bytes_to_seconds(next, bytes_written);
    if (buffer_end - next.pts()).abs() < sync_limit {
        return 0;
    }
    let info = next.stream_info();
    // Whole samples only
    let sample_delta = ((buffer_end - next.pts()) * f64::from(info.sample_rate)) as i64;
    sample_delta * i64::from(info.channel_count) * sample_size(next) as i64
}

/// Same stream and layout; anything else needs a device re-init
fn is_similar(current: Option<&Arc<DecodedFrame>>, next: &DecodedFrame) -> bool {
    current.map_or(false, |cur| {
        Arc::ptr_eq(cur.stream_info(), next.stream_info()) && cur.format() == next.format()
    })
}

/// Interleave planar samples, dropping the first `skip_bytes` of output
fn interleave(frame: &DecodedFrame, skip_bytes: usize) -> Vec<u8> {
    let channels = frame.stream_info().channel_count as usize;
    let size = sample_size(frame);
    if channels == 0 || size == 0 {
        return Vec::new();
    }
    let planes = frame.planes();
    if planes.len() < channels {
        warn!(
            "Planar frame at {:.3} has {} planes for {} channels, skipping",
            frame.pts(),
            planes.len(),
            channels
        );
        return Vec::new();
    }
    // A short plane limits every channel
    let plane_len = planes.iter().take(channels).map(Vec::len).min().unwrap_or(0);
    let sample_count = plane_len / size;
    let skipped = skip_bytes / channels / size;
    if sample_count <= skipped {
        return Vec::new();
    }

    let mut out = Vec::with_capacity((sample_count - skipped) * size * channels);
    for sample in skipped..sample_count {
        let offset = sample * size;
        for plane in planes.iter().take(channels) {
            out.extend_from_slice(&plane[offset..offset + size]);
        }
    }
    out
}

struct Inner {
    player: Option<Arc<dyn PlayerClock>>,
    input: Option<Arc<DecodedStream>>,
    device: Box<dyn AudioDevice>,
    cur_frame: Option<Arc<DecodedFrame>>,
    sync_time: f64,
    bytes_written: usize,
    needs_resync: bool,
    volume: f64,
    muted: bool,
}

impl Inner {
    fn is_playing(&self) -> bool {
        self.player.as_ref().map_or(false, |player| {
            player.playback_rate() == 1.0 && player.playback_state() == PlaybackState::Playing
        })
    }

    fn effective_volume(&self) -> f64 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    fn fill_silence(&mut self, mut bytes: usize) -> MediaResult<()> {
        while bytes > 0 {
            let chunk = bytes.min(SILENCE.len());
            self.device.append_buffer(&SILENCE[..chunk])?;
            self.bytes_written += chunk;
            bytes -= chunk;
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &DecodedFrame, skip_bytes: usize) -> MediaResult<()> {
        if frame.format().is_planar() {
            let data = interleave(frame, skip_bytes);
            if !data.is_empty() {
                self.device.append_buffer(&data)?;
                self.bytes_written += data.len();
            }
        } else if let Some(plane) = frame.planes().first() {
            if plane.len() > skip_bytes {
                self.device.append_buffer(&plane[skip_bytes..])?;
                self.bytes_written += plane.len() - skip_bytes;
            }
        }
        Ok(())
    }
}

struct Shared {
    clock: SharedClock,
    config: PipelineConfig,
    inner: TrackedMutex<Inner>,
    on_play: ThreadEvent<()>,
    shutdown: AtomicBool,
}

enum Step {
    Continue,
    Exit,
}

impl Shared {
    fn request_resync(&self) {
        self.inner.lock().needs_resync = true;
        self.on_play.signal(());
    }

    /// Park until playback may resume; the lock is released while waiting
    fn wait_for_play(&self, inner: TrackedMutexGuard<'_, Inner>) {
        let (_inner, woken) = self.on_play.reset_and_wait_while_unlocked(inner);
        if let Err(err) = woken {
            trace!("Audio renderer wait ended without a signal: {}", err);
        }
    }

    fn sleep_unlocked(&self, inner: TrackedMutexGuard<'_, Inner>, seconds: f64) {
        drop(inner);
        self.clock.sleep(Duration::from_secs_f64(seconds.max(0.0)));
    }

    fn run(&self) {
        info!("Audio renderer started");
        loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Exit) => break,
                Err(err) => {
                    error!("Audio device error, stopping renderer: {}", err);
                    break;
                }
            }
        }
        info!("Audio renderer exiting");
    }

    fn step(&self) -> MediaResult<Step> {
        let mut inner = self.inner.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(Step::Exit);
        }
        let (Some(player), Some(input)) = (inner.player.clone(), inner.input.clone()) else {
            self.wait_for_play(inner);
            return Ok(Step::Continue);
        };

        let playing = inner.is_playing();
        inner.device.set_device_state(playing);
        if !playing {
            self.wait_for_play(inner);
            return Ok(Step::Continue);
        }

        let mut time = player.current_time();
        let buffered_bytes = inner.device.bytes_buffered();
        let next = match inner.cur_frame.clone() {
            Some(cur) if !inner.needs_resync => {
                let extra = bytes_to_seconds(&cur, buffered_bytes) - self.config.audio_buffer_target;
                if extra > 0.0 {
                    self.sleep_unlocked(inner, extra);
                    return Ok(Step::Continue);
                }
                input.get_frame(cur.pts(), FrameLocation::After)
            }
            _ => {
                inner.device.clear_buffer();
                input.get_frame(time, FrameLocation::Near)
            }
        };
        let Some(next) = next else {
            let backoff = self.config.render_no_data_backoff().as_secs_f64();
            self.sleep_unlocked(inner, backoff);
            return Ok(Step::Continue);
        };

        if !is_similar(inner.cur_frame.as_ref(), &next) {
            if let Some(cur) = inner.cur_frame.clone() {
                // Let the old stream play out; re-init clears the device
                let delay = (bytes_to_seconds(&cur, buffered_bytes) - self.config.audio_sync_limit).max(0.0);
                debug!("Audio stream changed, draining {:.3}s before re-init", delay);
                let (relocked, ()) = TrackedMutexGuard::unlocked(inner, || {
                    self.clock.sleep(Duration::from_secs_f64(delay))
                });
                inner = relocked;
                if self.shutdown.load(Ordering::Acquire) {
                    return Ok(Step::Exit);
                }
                let playing = inner.is_playing();
                inner.device.set_device_state(playing);
                if !playing {
                    self.wait_for_play(inner);
                    return Ok(Step::Continue);
                }
                time = player.current_time();
            }

            let volume = inner.effective_volume();
            inner.device.init_device(&next, volume)?;
            inner.device.set_device_state(true);
            inner.needs_resync = true;
        }

        let adjust = if inner.needs_resync || inner.cur_frame.is_none() {
            inner.sync_time = time;
            inner.bytes_written = 0;
            sync_bytes(time, 0, &next, self.config.audio_sync_limit)
        } else {
            sync_bytes(inner.sync_time, inner.bytes_written, &next, self.config.audio_sync_limit)
        };

        let skip = if adjust < 0 {
            trace!("Inserting {} bytes of silence before pts={:.3}", -adjust, next.pts());
            inner.fill_silence(adjust.unsigned_abs() as usize)?;
            0
        } else {
            if adjust > 0 {
                trace!("Skipping {} bytes of pts={:.3}", adjust, next.pts());
            }
            adjust as usize
        };
        inner.write_frame(&next, skip)?;
        inner.cur_frame = Some(next);
        inner.needs_resync = false;
        Ok(Step::Continue)
    }
}

impl PipelineClient for Shared {
    fn on_playback_state_changed(&self, _old: PlaybackState, _new: PlaybackState) {
        self.request_resync();
    }

    fn on_playback_rate_changed(&self, _old: f64, _new: f64) {
        self.request_resync();
    }

    fn on_seeking(&self) {
        self.request_resync();
    }
}

/// Drives one [`AudioDevice`] from a decoded stream
pub struct AudioRenderer {
    shared: Arc<Shared>,
    thread: Option<TrackedThread>,
    registration: Option<(Arc<dyn PlayerClock>, ClientId)>,
}

impl AudioRenderer {
    /// Spawn the render thread; it parks until a player and input are set
    pub fn new(
        ctx: &SyncContext,
        config: &PipelineConfig,
        device: Box<dyn AudioDevice>,
    ) -> MediaResult<Self> {
        let shared = Arc::new(Shared {
            clock: Arc::clone(ctx.clock()),
            config: config.clone(),
            inner: TrackedMutex::new(
                "AudioRenderer",
                Arc::clone(ctx.tracker()),
                Inner {
                    player: None,
                    input: None,
                    device,
                    cur_frame: None,
                    sync_time: 0.0,
                    bytes_written: 0,
                    needs_resync: true,
                    volume: 1.0,
                    muted: false,
                },
            ),
            on_play: ThreadEvent::new("AudioRendererPlay", Arc::clone(ctx.tracker())),
            shutdown: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let thread = TrackedThread::spawn("AudioRenderer", Arc::clone(ctx.tracker()), move || worker.run())?;
        Ok(Self {
            shared,
            thread: Some(thread),
            registration: None,
        })
    }

    /// Follow `player`'s clock; `None` parks the renderer
    pub fn set_player(&mut self, player: Option<Arc<dyn PlayerClock>>) {
        if let Some((old, id)) = self.registration.take() {
            old.remove_client(id);
        }
        if let Some(player) = &player {
            let id = player.add_client(Arc::clone(&self.shared) as Arc<dyn PipelineClient>);
            self.registration = Some((Arc::clone(player), id));
        }
        let has_player = player.is_some();
        {
            let mut inner = self.shared.inner.lock();
            inner.player = player;
            inner.needs_resync = true;
        }
        if has_player {
            self.shared.on_play.signal(());
        }
    }

    pub fn attach(&self, input: Arc<DecodedStream>) {
        {
            let mut inner = self.shared.inner.lock();
            inner.input = Some(input);
            inner.needs_resync = true;
        }
        self.shared.on_play.signal(());
    }

    pub fn detach(&self) {
        let mut inner = self.shared.inner.lock();
        inner.input = None;
        inner.device.set_device_state(false);
    }

    pub fn volume(&self) -> f64 {
        self.shared.inner.lock_shared().volume
    }

    pub fn set_volume(&self, volume: f64) {
        let mut inner = self.shared.inner.lock();
        inner.volume = volume;
        let effective = inner.effective_volume();
        inner.device.update_volume(effective);
    }

    pub fn muted(&self) -> bool {
        self.shared.inner.lock_shared().muted
    }

    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.shared.inner.lock();
        inner.muted = muted;
        let effective = inner.effective_volume();
        inner.device.update_volume(effective);
    }

    /// True once the render thread has exited (stopped or device failure)
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, TrackedThread::is_finished)
    }

    /// Stop the thread and unregister from the player
    pub fn stop(&mut self) {
        {
            let _inner = self.shared.inner.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.on_play.signal(());
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
        if let Some((player, id)) = self.registration.take() {
            player.remove_client(id);
        }
    }
}

impl Drop for AudioRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{SampleFormat, StreamInfo};

    fn frame(info: &Arc<StreamInfo>, pts: f64, data: &[u8]) -> DecodedFrame {
        DecodedFrame::audio(Arc::clone(info), pts, pts, 0.01, SampleFormat::PackedU8, data.len() as u32, vec![data.to_vec()])
    }

    #[test]
    fn test_sync_bytes_within_limit_is_zero() {
        let info = StreamInfo::audio("pcm", 2, 1);
        let next = frame(&info, 2.05, &[1, 2]);
        // 4 bytes at 2 Hz mono ends at 2.0
        assert_eq!(sync_bytes(0.0, 4, &next, 0.1), 0);
    }

    #[test]
    fn test_sync_bytes_gap_needs_silence() {
        let info = StreamInfo::audio("pcm", 2, 1);
        let next = frame(&info, 3.0, &[5, 6, 7, 8]);
        assert_eq!(sync_bytes(0.0, 4, &next, 0.1), -2);
    }

    #[test]
    fn test_sync_bytes_overlap_skips() {
        let info = StreamInfo::audio("pcm", 2, 1);
        let next = frame(&info, 1.0, &[5, 6, 7, 8]);
        assert_eq!(sync_bytes(0.0, 4, &next, 0.1), 2);
    }

    #[test]
    fn test_sync_bytes_scales_with_channels_and_sample_size() {
        let info = StreamInfo::audio("pcm", 2, 2);
        let next = DecodedFrame::audio(Arc::clone(&info), 1.0, 1.0, 0.01, SampleFormat::PackedS16, 1, vec![vec![0; 4]]);
        // 1s of gap at 2 Hz is 2 samples, 4 bytes each
        assert_eq!(sync_bytes(0.0, 0, &next, 0.1), -8);
    }

    #[test]
    fn test_interleave_planar() {
        let info = StreamInfo::audio("pcm", 2, 2);
        let left = vec![1, 1, 2, 2, 3, 3];
        let right = vec![4, 4, 5, 5, 6, 6];
        let planar = DecodedFrame::audio(info, 0.0, 0.0, 0.01, SampleFormat::PlanarS16, 3, vec![left, right]);
        assert_eq!(interleave(&planar, 0), vec![1, 1, 4, 4, 2, 2, 5, 5, 3, 3, 6, 6]);
        // Skipping one interleaved sample frame (2 channels x 2 bytes)
        assert_eq!(interleave(&planar, 4), vec![2, 2, 5, 5, 3, 3, 6, 6]);
        assert!(interleave(&planar, 12).is_empty());
    }

    #[test]
    fn test_interleave_uneven_planes_uses_shortest() {
        let info = StreamInfo::audio("pcm", 2, 2);
        let planar = DecodedFrame::audio(info, 0.0, 0.0, 0.01, SampleFormat::PlanarS16, 2, vec![vec![1, 2, 3, 4], vec![5, 6]]);
        assert_eq!(interleave(&planar, 0), vec![1, 2, 5, 6]);
        assert!(interleave(&planar, 4).is_empty());
    }

    #[test]
    fn test_interleave_missing_plane_is_skipped() {
        let info = StreamInfo::audio("pcm", 2, 2);
        let planar = DecodedFrame::audio(info, 0.0, 0.0, 0.01, SampleFormat::PlanarS16, 2, vec![vec![1, 2, 3, 4]]);
        assert!(interleave(&planar, 0).is_empty());
    }

    #[test]
    fn test_similarity_requires_same_stream() {
        let info1 = StreamInfo::audio("pcm", 2, 1);
        let info2 = StreamInfo::audio("pcm", 2, 1);
        let a = Arc::new(frame(&info1, 0.0, &[1]));
        let b = frame(&info1, 1.0, &[2]);
        let c = frame(&info2, 1.0, &[2]);
        assert!(is_similar(Some(&a), &b));
        assert!(!is_similar(Some(&a), &c));
        assert!(!is_similar(None, &b));
    }
}
