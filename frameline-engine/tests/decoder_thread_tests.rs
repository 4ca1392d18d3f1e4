//! Decode worker: keyframe restarts, key waits, errors and end-of-stream flush

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use frameline_common::{ManualClock, PipelineConfig, SyncContext};
use frameline_engine::media::{
    DecodedFrame, Decoder, Decryptor, EncodedFrame, EncryptionInfo, Frame, FrameLocation, SampleFormat,
    StreamInfo,
};
use frameline_engine::playback::DecoderCallbacks;
use frameline_engine::{
    DecodedStream, DecoderThread, ElementaryStream, MediaError, MediaResult, PipelineManager,
};

/// What the mock decoder saw; `None` is a flush
#[derive(Default)]
struct DecodeLog {
    decoded: Mutex<Vec<Option<f64>>>,
    resets: AtomicUsize,
}

impl DecodeLog {
    fn decoded(&self) -> Vec<Option<f64>> {
        self.decoded.lock().unwrap().clone()
    }
}

struct MockDecoder {
    log: Arc<DecodeLog>,
    fail: bool,
}

impl Decoder for MockDecoder {
    fn decode(
        &mut self,
        frame: Option<&EncodedFrame>,
        decryptor: Option<&dyn Decryptor>,
    ) -> MediaResult<Vec<Arc<DecodedFrame>>> {
        let Some(frame) = frame else {
            self.log.decoded.lock().unwrap().push(None);
            return Ok(Vec::new());
        };
        frame.decrypt(decryptor)?;
        self.log.decoded.lock().unwrap().push(Some(frame.pts()));
        if self.fail {
            return Err(MediaError::Decode("bad frame".to_string()));
        }
        Ok(vec![Arc::new(DecodedFrame::audio(
            Arc::clone(frame.stream_info()),
            frame.pts(),
            frame.dts(),
            frame.duration(),
            SampleFormat::PackedS16,
            0,
            vec![Vec::new()],
        ))])
    }

    fn reset_decoder(&mut self) {
        self.log.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds the decoder inside `decode` until released
#[derive(Default)]
struct DecodeGate {
    entered: AtomicBool,
    released: AtomicBool,
}

struct GatedDecoder {
    inner: MockDecoder,
    gate: Arc<DecodeGate>,
    hold_pts: f64,
}

impl Decoder for GatedDecoder {
    fn decode(
        &mut self,
        frame: Option<&EncodedFrame>,
        decryptor: Option<&dyn Decryptor>,
    ) -> MediaResult<Vec<Arc<DecodedFrame>>> {
        if frame.map(|f| f.pts()) == Some(self.hold_pts) {
            self.gate.entered.store(true, Ordering::SeqCst);
            while !self.gate.released.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        self.inner.decode(frame, decryptor)
    }

    fn reset_decoder(&mut self) {
        self.inner.reset_decoder();
    }
}

/// Refuses to decrypt until the key "arrives"
struct SlowKeyDecryptor {
    has_key: AtomicBool,
}

impl Decryptor for SlowKeyDecryptor {
    fn decrypt(&self, _info: &EncryptionInfo, data: &[u8]) -> MediaResult<Vec<u8>> {
        if self.has_key.load(Ordering::SeqCst) {
            Ok(data.to_vec())
        } else {
            Err(MediaError::KeyNotFound)
        }
    }
}

#[derive(Default)]
struct CallbackCounts {
    seek_done: AtomicUsize,
    waiting_for_key: AtomicUsize,
    errors: Mutex<Vec<MediaError>>,
}

impl CallbackCounts {
    fn callbacks(self: &Arc<Self>) -> DecoderCallbacks {
        let seek_done = Arc::clone(self);
        let waiting = Arc::clone(self);
        let errors = Arc::clone(self);
        DecoderCallbacks {
            seek_done: Box::new(move || {
                seek_done.seek_done.fetch_add(1, Ordering::SeqCst);
            }),
            waiting_for_key: Box::new(move || {
                waiting.waiting_for_key.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Box::new(move |err| errors.errors.lock().unwrap().push(err)),
        }
    }
}

struct Harness {
    ctx: SyncContext,
    pipeline: Arc<PipelineManager>,
    input: Arc<ElementaryStream>,
    output: Arc<DecodedStream>,
    log: Arc<DecodeLog>,
    counts: Arc<CallbackCounts>,
    decoder: DecoderThread,
}

impl Harness {
    fn new(config: PipelineConfig) -> Self {
        let ctx = SyncContext::with_clock(ManualClock::shared());
        let pipeline = Arc::new(PipelineManager::new(&ctx, Box::new(|_| ()), Box::new(|| ())));
        pipeline.done_initializing();
        let counts = Arc::new(CallbackCounts::default());
        let decoder = DecoderThread::new(&ctx, &config, Arc::clone(&pipeline), counts.callbacks())
            .expect("decoder thread should spawn");
        Self {
            input: Arc::new(ElementaryStream::encoded(&ctx)),
            output: Arc::new(DecodedStream::decoded(&ctx)),
            log: Arc::new(DecodeLog::default()),
            ctx,
            pipeline,
            counts,
            decoder,
        }
    }

    /// Frames every `step` seconds over `[0, end)`, keyframes every `key_every`
    fn fill(&self, end: f64, step: f64, key_every: usize) {
        let info = StreamInfo::audio("pcm", 8000, 1);
        let count = (end / step).round() as usize;
        for i in 0..count {
            let time = i as f64 * step;
            self.input.add_frame(Arc::new(EncodedFrame::new(
                Arc::clone(&info),
                time,
                time,
                step,
                i % key_every == 0,
                vec![0u8; 4],
            )));
        }
    }

    fn start(&self, fail: bool) {
        self.decoder.attach(Arc::clone(&self.input), Arc::clone(&self.output));
        self.decoder.set_decoder(Some(Box::new(MockDecoder {
            log: Arc::clone(&self.log),
            fail,
        })));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.decoder.stop();
        self.ctx.teardown();
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_starts_from_key_frame_before_seek_target() {
    let h = Harness::new(PipelineConfig::default());
    h.fill(5.0, 0.5, 4);
    h.pipeline.set_current_time(2.7);
    h.start(false);

    wait_for("frame at the playhead", || {
        h.output.get_frame(2.7, FrameLocation::Near).is_some()
            && h.counts.seek_done.load(Ordering::SeqCst) == 1
    });
    assert_eq!(h.log.decoded()[0], Some(2.0));
    assert_eq!(h.log.resets.load(Ordering::SeqCst), 1);
    assert_eq!(h.output.count_frames_between(-1.0, 1.9), 0);
}

#[test]
fn test_stays_bounded_ahead_of_playhead() {
    let h = Harness::new(PipelineConfig::default());
    h.fill(10.0, 0.25, 4);
    h.start(false);

    wait_for("buffer ahead", || h.log.decoded().len() >= 5);
    std::thread::sleep(Duration::from_millis(50));

    let ranges = h.output.get_buffered_ranges();
    assert_eq!(ranges.len(), 1);
    assert!(ranges[0].end > 1.0, "buffered to {}", ranges[0].end);
    assert!(ranges[0].end <= 1.5, "buffered to {}", ranges[0].end);
}

#[test]
fn test_seek_restarts_from_new_key_frame() {
    let h = Harness::new(PipelineConfig::default());
    h.fill(6.0, 0.5, 4);
    h.start(false);
    wait_for("initial buffer", || h.output.count_frames_between(-1.0, 1.1) >= 2);
    std::thread::sleep(Duration::from_millis(20));

    h.pipeline.set_current_time(4.2);
    wait_for("frame at the new playhead", || {
        h.output.get_frame(4.2, FrameLocation::Near).is_some()
            && h.counts.seek_done.load(Ordering::SeqCst) == 1
    });

    assert_eq!(h.output.count_frames_between(-1.0, 3.9), 0);
    assert_eq!(h.log.resets.load(Ordering::SeqCst), 2);
    assert!(h.log.decoded().contains(&Some(4.0)));
}

#[test]
fn test_waiting_for_key_raised_once() {
    let h = Harness::new(PipelineConfig {
        missing_key_backoff_ms: 1,
        ..PipelineConfig::default()
    });
    let info = StreamInfo::audio("pcm", 8000, 1);
    let encryption = EncryptionInfo {
        key_id: vec![1; 16],
        iv: vec![0; 16],
        subsamples: Vec::new(),
    };
    for i in 0..4 {
        let time = i as f64 * 0.25;
        let frame = EncodedFrame::new(Arc::clone(&info), time, time, 0.25, i == 0, vec![7u8; 4])
            .with_encryption(encryption.clone());
        h.input.add_frame(Arc::new(frame));
    }
    let decryptor = Arc::new(SlowKeyDecryptor {
        has_key: AtomicBool::new(false),
    });
    h.decoder.set_decryptor(Some(decryptor.clone()));
    h.start(false);

    wait_for("waiting for key", || h.counts.waiting_for_key.load(Ordering::SeqCst) == 1);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(h.counts.waiting_for_key.load(Ordering::SeqCst), 1);
    assert!(h.log.decoded().is_empty());

    decryptor.has_key.store(true, Ordering::SeqCst);
    wait_for("decoded after key", || h.log.decoded().len() == 4);
    assert!(h.counts.errors.lock().unwrap().is_empty());
}

#[test]
fn test_missing_decryptor_is_fatal() {
    let h = Harness::new(PipelineConfig::default());
    let info = StreamInfo::audio("pcm", 8000, 1);
    let encryption = EncryptionInfo {
        key_id: vec![1; 16],
        iv: vec![0; 16],
        subsamples: Vec::new(),
    };
    let frame = EncodedFrame::new(info, 0.0, 0.0, 0.25, true, vec![7u8; 4]).with_encryption(encryption);
    h.input.add_frame(Arc::new(frame));
    h.start(false);

    wait_for("error", || !h.counts.errors.lock().unwrap().is_empty());
    assert_eq!(*h.counts.errors.lock().unwrap(), vec![MediaError::NoDecryptor]);
}

#[test]
fn test_decode_error_stops_thread() {
    let h = Harness::new(PipelineConfig::default());
    h.fill(2.0, 0.5, 4);
    h.start(true);

    wait_for("error", || !h.counts.errors.lock().unwrap().is_empty());
    std::thread::sleep(Duration::from_millis(30));

    assert_eq!(
        *h.counts.errors.lock().unwrap(),
        vec![MediaError::Decode("bad frame".to_string())]
    );
    assert_eq!(h.log.decoded(), vec![Some(0.0)]);
    assert!(h.output.is_empty());
}

#[test]
fn test_flushes_once_at_end_of_stream() {
    let h = Harness::new(PipelineConfig {
        end_delta: 0.2,
        decode_buffer_ahead: 5.0,
        ..PipelineConfig::default()
    });
    h.pipeline.set_duration(Some(1.0));
    h.fill(1.0, 0.1, 5);
    h.start(false);

    wait_for("flush", || h.log.decoded().contains(&None));
    std::thread::sleep(Duration::from_millis(50));

    let decoded = h.log.decoded();
    assert_eq!(decoded.iter().filter(|d| d.is_none()).count(), 1);
    assert_eq!(decoded.last(), Some(&None));
    assert_eq!(decoded.len(), 11);
}

#[test]
fn test_no_flush_without_known_duration() {
    let h = Harness::new(PipelineConfig::default());
    h.fill(0.5, 0.25, 2);
    h.start(false);

    wait_for("all frames", || h.log.decoded().len() == 2);
    std::thread::sleep(Duration::from_millis(50));
    assert!(!h.log.decoded().contains(&None));
}

#[test]
fn test_parks_without_decoder() {
    let h = Harness::new(PipelineConfig::default());
    h.fill(1.0, 0.25, 4);
    h.decoder.attach(Arc::clone(&h.input), Arc::clone(&h.output));
    std::thread::sleep(Duration::from_millis(30));
    assert!(h.output.is_empty());

    h.decoder.set_decoder(Some(Box::new(MockDecoder {
        log: Arc::clone(&h.log),
        fail: false,
    })));
    wait_for("decoding", || !h.output.is_empty());
}

#[test]
fn test_frames_decoded_across_seek_are_dropped() {
    let h = Harness::new(PipelineConfig::default());
    h.fill(10.0, 0.5, 4);
    let gate = Arc::new(DecodeGate::default());
    h.decoder.attach(Arc::clone(&h.input), Arc::clone(&h.output));
    h.decoder.set_decoder(Some(Box::new(GatedDecoder {
        inner: MockDecoder {
            log: Arc::clone(&h.log),
            fail: false,
        },
        gate: Arc::clone(&gate),
        hold_pts: 0.5,
    })));

    wait_for("decode in flight", || gate.entered.load(Ordering::SeqCst));
    h.pipeline.set_current_time(6.3);
    assert!(h.output.is_empty());
    gate.released.store(true, Ordering::SeqCst);

    wait_for("frame at the new playhead", || {
        h.output.get_frame(6.3, FrameLocation::Near).is_some()
            && h.counts.seek_done.load(Ordering::SeqCst) == 1
    });
    assert_eq!(h.output.count_frames_between(-1.0, 5.9), 0);

    // The held frame finished decoding, then decoding restarted at the keyframe
    let decoded = h.log.decoded();
    let held = decoded.iter().position(|d| *d == Some(0.5)).expect("held frame decoded");
    assert_eq!(decoded.get(held + 1), Some(&Some(6.0)));
}
