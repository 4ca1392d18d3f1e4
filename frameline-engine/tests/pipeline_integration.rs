//! End-to-end playback of synthetic media with real threads and the wall clock

use std::io::Write;
use std::time::Duration;

use frameline_common::config::load_config;
use frameline_common::PipelineConfig;
use frameline_engine::media::PlaybackState;
use frameline_engine::sim::{run_simulation, SimOptions, SIM_SAMPLE_RATE};
use frameline_engine::{AudioRenderer, DecoderThread, DemuxerThread, PipelineManager, PipelineMonitor};
use serial_test::serial;

fn options(duration: f64, with_video: bool) -> SimOptions {
    SimOptions {
        duration,
        segment_length: 0.5,
        with_video,
        timeout: Duration::from_secs(20),
    }
}

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_pipeline_parts_can_be_shared_across_threads() {
    assert_send_sync::<PipelineManager>();
    assert_send_sync::<PipelineMonitor>();
    assert_send_sync::<DecoderThread>();
    assert_send_sync::<DemuxerThread>();
    assert_send_sync::<AudioRenderer>();
}

#[test]
#[serial]
fn test_audio_only_plays_to_end() {
    let report = run_simulation(&PipelineConfig::default(), &options(1.0, false)).unwrap();

    assert_eq!(report.final_state, PlaybackState::Ended);
    assert!(!report.timed_out);
    assert_eq!(report.media_time, 1.0);
    assert_eq!(report.appends_succeeded, 2);
    assert_eq!(report.appends_failed, 0);
    assert_eq!(report.audio_frames_decoded, 10);
    assert_eq!(report.video_frames_decoded, 0);
    assert_eq!(report.audio_device_inits, 1);
    // One second of 8 kHz mono U8, give or take silence and skips at the sync limit
    let expected = u64::from(SIM_SAMPLE_RATE);
    assert!(report.audio_bytes_written >= expected * 9 / 10, "{}", report.audio_bytes_written);
    assert_eq!(report.video_quality.total_video_frames, 0);
}

#[test]
#[serial]
fn test_audio_and_video_play_to_end() {
    let report = run_simulation(&PipelineConfig::default(), &options(1.0, true)).unwrap();

    assert_eq!(report.final_state, PlaybackState::Ended);
    assert!(!report.timed_out);
    assert_eq!(report.appends_succeeded, 4);
    assert_eq!(report.video_frames_decoded, 30);
    assert!(report.video_quality.total_video_frames > 0);
    assert!(report.video_quality.total_video_frames <= 30);
    assert_eq!(report.buffered.len(), 1);
    assert_eq!(report.buffered[0].start, 0.0);
}

#[test]
#[serial]
fn test_runs_with_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[pipeline]\nmonitor_poll_ms = 5\ndecode_buffer_ahead = 0.5").unwrap();
    let config = load_config(Some(file.path())).unwrap();
    assert_eq!(config.pipeline.monitor_poll_ms, 5);

    let report = run_simulation(&config.pipeline, &options(0.5, true)).unwrap();
    assert_eq!(report.final_state, PlaybackState::Ended);
    assert!(!report.timed_out);
}

#[test]
#[serial]
fn test_report_serializes_to_toml() {
    let report = run_simulation(&PipelineConfig::default(), &options(0.3, false)).unwrap();
    let text = toml::to_string(&report).unwrap();
    assert!(text.contains("final_state = \"Ended\""), "{}", text);
    assert!(text.contains("timed_out = false"));
}
