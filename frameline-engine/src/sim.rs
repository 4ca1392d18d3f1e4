//! Synthetic back ends and an end-to-end pipeline run
//!
//! The segment format is a flat list of frame records:
//!
//! | bytes | field                  |
//! |-------|------------------------|
//! | 1     | flags (bit 0: keyframe)|
//! | 8     | pts, f64 little endian |
//! | 8     | duration, f64 LE       |
//! | 4     | payload length, u32 LE |
//! | n     | payload                |
//!
//! The decoder passes payload bytes through as PCM samples (audio) or pixel
//! data (video); the audio device consumes bytes in real time against the
//! injected clock.

use crate::error::{MediaError, MediaResult};
use crate::media::{
    intersect_buffered_ranges, AudioDevice, BufferedRange, DecodedFrame, DecodedStream, Decoder,
    Decryptor, Demuxer, ElementaryStream, EncodedFrame, Frame, FrameFormat, PixelFormat,
    PlaybackState, PlayerClock, ReadyState, SampleFormat, StreamInfo, VideoPlaybackQuality,
};
use crate::playback::{DecoderCallbacks, DecoderThread, DemuxerThread, PipelineManager, PipelineMonitor};
use crate::render::{AudioRenderer, VideoRendererCommon};
use frameline_common::{PipelineConfig, SharedClock, SyncContext, SystemClock, TaskRunner};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sample rate of the synthetic audio track
pub const SIM_SAMPLE_RATE: u32 = 8000;

const RECORD_HEADER: usize = 1 + 8 + 8 + 4;
const KEY_FRAME_FLAG: u8 = 0x01;

/// One frame record in a synthetic segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFrame {
    pub pts: f64,
    pub duration: f64,
    pub is_key_frame: bool,
    pub payload: Vec<u8>,
}

/// Serialize frame records into a segment
pub fn encode_segment(frames: &[SegmentFrame]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames.iter().map(|f| RECORD_HEADER + f.payload.len()).sum());
    for frame in frames {
        out.push(if frame.is_key_frame { KEY_FRAME_FLAG } else { 0 });
        out.extend_from_slice(&frame.pts.to_le_bytes());
        out.extend_from_slice(&frame.duration.to_le_bytes());
        out.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame.payload);
    }
    out
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> MediaResult<[u8; N]> {
    data.get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| MediaError::InvalidContainerData(format!("truncated record at byte {}", at)))
}

/// Demuxer for the synthetic segment format
pub struct SyntheticDemuxer {
    stream: Arc<StreamInfo>,
}

impl SyntheticDemuxer {
    pub fn new(stream: Arc<StreamInfo>) -> Self {
        Self { stream }
    }
}

impl Demuxer for SyntheticDemuxer {
    fn demux(&mut self, timestamp_offset: f64, data: &[u8]) -> MediaResult<Vec<Arc<EncodedFrame>>> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let [flags] = read_array::<1>(data, pos)?;
            let pts = f64::from_le_bytes(read_array(data, pos + 1)?) + timestamp_offset;
            let duration = f64::from_le_bytes(read_array(data, pos + 9)?);
            let len = u32::from_le_bytes(read_array(data, pos + 17)?) as usize;
            let start = pos + RECORD_HEADER;
            let payload = data.get(start..start + len).ok_or_else(|| {
                MediaError::InvalidContainerData(format!("payload of {} bytes overruns segment", len))
            })?;
            frames.push(Arc::new(EncodedFrame::new(
                Arc::clone(&self.stream),
                pts,
                pts,
                duration,
                flags & KEY_FRAME_FLAG != 0,
                payload.to_vec(),
            )));
            pos = start + len;
        }
        Ok(frames)
    }

    fn reset(&mut self) {}
}

/// Pass-through decoder
///
/// Audio payloads become packed U8 mono/interleaved samples; video payloads
/// become a single RGB24 plane.
pub struct SyntheticDecoder {
    decoded: Arc<AtomicU64>,
}

impl SyntheticDecoder {
    /// `decoded` counts frames produced
    pub fn new(decoded: Arc<AtomicU64>) -> Self {
        Self { decoded }
    }
}

impl Decoder for SyntheticDecoder {
    fn decode(
        &mut self,
        frame: Option<&EncodedFrame>,
        decryptor: Option<&dyn Decryptor>,
    ) -> MediaResult<Vec<Arc<DecodedFrame>>> {
        let Some(frame) = frame else {
            return Ok(Vec::new());
        };
        let data = frame.decrypt(decryptor)?.into_owned();
        let info = Arc::clone(frame.stream_info());
        let decoded = if info.is_video {
            let linesize = info.width as usize * 3;
            DecodedFrame::video(
                info.clone(),
                frame.pts(),
                frame.dts(),
                frame.duration(),
                PixelFormat::Rgb24,
                info.width,
                info.height,
                vec![data],
                vec![linesize],
            )
        } else {
            let channels = info.channel_count.max(1) as usize;
            let samples = (data.len() / channels) as u32;
            DecodedFrame::audio(
                info,
                frame.pts(),
                frame.dts(),
                frame.duration(),
                SampleFormat::PackedU8,
                samples,
                vec![data],
            )
        };
        self.decoded.fetch_add(1, Ordering::Relaxed);
        Ok(vec![Arc::new(decoded)])
    }

    fn reset_decoder(&mut self) {}
}

/// Counters shared between a [`SimulatedAudioDevice`] and its owner
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub bytes_written: AtomicU64,
    pub device_inits: AtomicU64,
}

#[derive(Debug)]
struct Playout {
    queued: usize,
    playing: bool,
    bytes_per_second: f64,
    last_update: Duration,
}

/// Audio sink that plays queued bytes in real time against a clock
pub struct SimulatedAudioDevice {
    clock: SharedClock,
    playout: Mutex<Playout>,
    stats: Arc<DeviceStats>,
}

impl SimulatedAudioDevice {
    pub fn new(clock: SharedClock, stats: Arc<DeviceStats>) -> Self {
        let now = clock.now();
        Self {
            clock,
            playout: Mutex::new(Playout {
                queued: 0,
                playing: false,
                bytes_per_second: 0.0,
                last_update: now,
            }),
            stats,
        }
    }

    /// Drain whatever played since the last update
    fn settle(&self) -> std::sync::MutexGuard<'_, Playout> {
        let mut playout = self.playout.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        if playout.playing {
            let elapsed = now.saturating_sub(playout.last_update).as_secs_f64();
            let played = (elapsed * playout.bytes_per_second) as usize;
            playout.queued = playout.queued.saturating_sub(played);
        }
        playout.last_update = now;
        playout
    }
}

impl AudioDevice for SimulatedAudioDevice {
    fn init_device(&mut self, frame: &DecodedFrame, volume: f64) -> MediaResult<()> {
        let FrameFormat::Audio(format) = frame.format() else {
            return Err(MediaError::Device("video frame sent to audio device".to_string()));
        };
        let info = frame.stream_info();
        let mut playout = self.settle();
        playout.queued = 0;
        playout.bytes_per_second =
            f64::from(info.sample_rate) * f64::from(info.channel_count) * format.bytes_per_sample() as f64;
        self.stats.device_inits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Audio device opened: {} Hz, {} channels, volume {:.2}",
            info.sample_rate, info.channel_count, volume
        );
        Ok(())
    }

    fn append_buffer(&mut self, data: &[u8]) -> MediaResult<()> {
        self.settle().queued += data.len();
        self.stats.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn clear_buffer(&mut self) {
        self.settle().queued = 0;
    }

    fn bytes_buffered(&self) -> usize {
        self.settle().queued
    }

    fn set_device_state(&mut self, playing: bool) {
        self.settle().playing = playing;
    }

    fn update_volume(&mut self, volume: f64) {
        debug!("Audio device volume {:.2}", volume);
    }
}

/// Parameters of one simulated run
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Media duration in seconds
    pub duration: f64,
    /// Length of each appended segment in seconds
    pub segment_length: f64,
    /// Include a video track next to the audio track
    pub with_video: bool,
    /// Give up if playback has not ended after this long
    pub timeout: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            duration: 3.0,
            segment_length: 1.0,
            with_video: true,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Outcome of [`run_simulation`]
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub final_state: PlaybackState,
    pub ready_state: ReadyState,
    pub media_time: f64,
    pub timed_out: bool,
    pub appends_succeeded: usize,
    pub appends_failed: usize,
    pub audio_frames_decoded: u64,
    pub video_frames_decoded: u64,
    pub audio_bytes_written: u64,
    pub audio_device_inits: u64,
    pub video_quality: VideoPlaybackQuality,
    pub buffered: Vec<BufferedRange>,
}

const AUDIO_FRAME: f64 = 0.1;
const VIDEO_FRAME: f64 = 1.0 / 30.0;
const VIDEO_GOP: usize = 15;

fn audio_segment(start: f64, end: f64) -> Vec<u8> {
    let bytes_per_frame = (f64::from(SIM_SAMPLE_RATE) * AUDIO_FRAME) as usize;
    let frames: Vec<SegmentFrame> = frame_times(start, end, AUDIO_FRAME)
        .map(|(_, pts)| SegmentFrame {
            pts,
            duration: AUDIO_FRAME,
            is_key_frame: true,
            payload: vec![0x80; bytes_per_frame],
        })
        .collect();
    encode_segment(&frames)
}

fn video_segment(start: f64, end: f64, width: u32, height: u32) -> Vec<u8> {
    let frame_bytes = (width * height * 3) as usize;
    let frames: Vec<SegmentFrame> = frame_times(start, end, VIDEO_FRAME)
        .map(|(index, pts)| SegmentFrame {
            pts,
            duration: VIDEO_FRAME,
            is_key_frame: index % VIDEO_GOP == 0,
            payload: vec![(index % 256) as u8; frame_bytes],
        })
        .collect();
    encode_segment(&frames)
}

/// `(global index, pts)` of fixed-length frames in `[start, end)`
fn frame_times(start: f64, end: f64, frame: f64) -> impl Iterator<Item = (usize, f64)> {
    let first = (start / frame).round() as usize;
    let last = (end / frame).round() as usize;
    (first..last).map(move |index| (index, index as f64 * frame))
}

/// One track's worker threads
struct Track {
    encoded: Arc<ElementaryStream>,
    decoded: Arc<DecodedStream>,
    demuxer: DemuxerThread,
    decoder: DecoderThread,
    frames_decoded: Arc<AtomicU64>,
}

impl Track {
    fn new(
        ctx: &SyncContext,
        config: &PipelineConfig,
        name: &str,
        info: Arc<StreamInfo>,
        pipeline: &Arc<PipelineManager>,
        runner: &Arc<TaskRunner>,
    ) -> MediaResult<Self> {
        let encoded = Arc::new(ElementaryStream::encoded(ctx));
        let decoded = Arc::new(DecodedStream::decoded(ctx));

        let weak = Arc::downgrade(pipeline);
        let demuxer = DemuxerThread::new(
            ctx,
            config,
            name,
            Arc::clone(pipeline),
            Arc::clone(&encoded),
            Some(Arc::clone(runner)),
            Box::new(move |err| {
                warn!("Demux failed: {}", err);
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.on_error();
                }
            }),
        )?;
        demuxer.set_demuxer(Some(Box::new(SyntheticDemuxer::new(info))));

        let weak = Arc::downgrade(pipeline);
        let callbacks = DecoderCallbacks {
            on_error: Box::new(move |err| {
                warn!("Decode failed: {}", err);
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.on_error();
                }
            }),
            ..DecoderCallbacks::default()
        };
        let frames_decoded = Arc::new(AtomicU64::new(0));
        let decoder = DecoderThread::new(ctx, config, Arc::clone(pipeline), callbacks)?;
        decoder.set_decoder(Some(Box::new(SyntheticDecoder::new(Arc::clone(&frames_decoded)))));
        decoder.attach(Arc::clone(&encoded), Arc::clone(&decoded));

        Ok(Self {
            encoded,
            decoded,
            demuxer,
            decoder,
            frames_decoded,
        })
    }

    fn stop(&mut self) {
        self.demuxer.stop();
        self.decoder.stop();
    }
}

/// Play synthetic media from start to end with real threads and the system clock
pub fn run_simulation(config: &PipelineConfig, options: &SimOptions) -> MediaResult<SimReport> {
    let ctx = SyncContext::with_clock(SystemClock::shared());
    let clock = Arc::clone(ctx.clock());
    let runner = Arc::new(TaskRunner::new("SimEvents", &ctx)?);

    let pipeline = Arc::new(PipelineManager::new(
        &ctx,
        Box::new(|state| info!("Playback state: {}", state)),
        Box::new(|| debug!("Seek")),
    ));

    let audio_info = StreamInfo::audio("pcm", SIM_SAMPLE_RATE, 1);
    let mut tracks = vec![Track::new(&ctx, config, "audio", audio_info, &pipeline, &runner)?];
    let video_info = StreamInfo::video("raw", 4, 2);
    if options.with_video {
        tracks.push(Track::new(&ctx, config, "video", Arc::clone(&video_info), &pipeline, &runner)?);
    }

    let encoded: Vec<Arc<ElementaryStream>> = tracks.iter().map(|t| Arc::clone(&t.encoded)).collect();
    let decoded: Vec<Arc<DecodedStream>> = tracks.iter().map(|t| Arc::clone(&t.decoded)).collect();
    let encoded_for_report = encoded.clone();
    let mut monitor = PipelineMonitor::new(
        &ctx,
        config,
        Arc::clone(&pipeline),
        Box::new(move || {
            let ranges: Vec<_> = encoded.iter().map(|s| s.get_buffered_ranges()).collect();
            intersect_buffered_ranges(&ranges)
        }),
        Box::new(move || {
            let ranges: Vec<_> = decoded.iter().map(|s| s.get_buffered_ranges()).collect();
            intersect_buffered_ranges(&ranges)
        }),
        Box::new(|ready| debug!("Ready state: {}", ready)),
    )?;

    let stats = Arc::new(DeviceStats::default());
    let device = SimulatedAudioDevice::new(Arc::clone(&clock), Arc::clone(&stats));
    let mut audio = AudioRenderer::new(&ctx, config, Box::new(device))?;
    audio.set_player(Some(Arc::clone(&pipeline) as Arc<dyn PlayerClock>));
    audio.attach(Arc::clone(&tracks[0].decoded));

    let mut video = VideoRendererCommon::new(&ctx);
    if let Some(track) = tracks.get(1) {
        video.set_player(Some(Arc::clone(&pipeline) as Arc<dyn PlayerClock>));
        video.attach(Arc::clone(&track.decoded));
    }

    pipeline.set_duration(Some(options.duration));
    pipeline.done_initializing();
    monitor.start();
    pipeline.play();

    let succeeded = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let segment_length = options.segment_length.max(AUDIO_FRAME);
    let mut start = 0.0;
    while start < options.duration {
        let end = (start + segment_length).min(options.duration);
        for (index, track) in tracks.iter().enumerate() {
            let data = if index == 0 {
                audio_segment(start, end)
            } else {
                video_segment(start, end, video_info.width, video_info.height)
            };
            let (ok, err) = (Arc::clone(&succeeded), Arc::clone(&failed));
            track.demuxer.append_data(
                0.0,
                0.0,
                f64::INFINITY,
                data,
                Box::new(move |success| {
                    let counter = if success { &ok } else { &err };
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        start = end;
    }

    let started = clock.now();
    let mut timed_out = false;
    loop {
        let state = pipeline.playback_state();
        if matches!(state, PlaybackState::Ended | PlaybackState::Errored) {
            break;
        }
        if clock.now().saturating_sub(started) > options.timeout {
            warn!("Simulation timed out in state {}", state);
            timed_out = true;
            break;
        }
        let (_, delay) = video.get_current_frame();
        clock.sleep(Duration::from_secs_f64(delay));
    }

    let report = SimReport {
        final_state: pipeline.playback_state(),
        ready_state: monitor.ready_state(),
        media_time: pipeline.current_time(),
        timed_out,
        appends_succeeded: succeeded.load(Ordering::Relaxed),
        appends_failed: failed.load(Ordering::Relaxed),
        audio_frames_decoded: tracks[0].frames_decoded.load(Ordering::Relaxed),
        video_frames_decoded: tracks.get(1).map_or(0, |t| t.frames_decoded.load(Ordering::Relaxed)),
        audio_bytes_written: stats.bytes_written.load(Ordering::Relaxed),
        audio_device_inits: stats.device_inits.load(Ordering::Relaxed),
        video_quality: video.video_playback_quality(),
        buffered: intersect_buffered_ranges(
            &encoded_for_report.iter().map(|s| s.get_buffered_ranges()).collect::<Vec<_>>(),
        ),
    };

    monitor.shutdown();
    audio.stop();
    video.set_player(None);
    for track in &mut tracks {
        track.stop();
    }
    runner.stop();
    ctx.teardown();
    info!("Simulation finished in state {}", report.final_state);
    Ok(report)
}
