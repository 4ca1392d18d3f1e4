//! Value types shared by buffers, workers and renderers

use serde::Serialize;
use std::fmt;

/// Frames closer together than this (seconds) belong to the same buffered range
pub const MAX_GAP: f64 = 0.15;

/// Contiguous span of buffered media, in presentation time
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Seconds of contiguous data available from `time` onward
///
/// Only the first range that ends after `time` is considered, and only if it
/// starts within [`MAX_GAP`] of `time`.
pub fn buffered_ahead(ranges: &[BufferedRange], time: f64) -> f64 {
    match ranges.iter().find(|r| r.end > time) {
        Some(range) if range.start < time + MAX_GAP => range.end - time.max(range.start),
        _ => 0.0,
    }
}

/// True if a single range covers `[start, end]`
///
/// A range that starts at `start` also counts when `end` is within
/// `end_delta` of the (known) duration, so playback can reach the end of the
/// media without buffering past it.
pub fn is_buffered_until(
    ranges: &[BufferedRange],
    start: f64,
    end: f64,
    duration: Option<f64>,
    end_delta: f64,
) -> bool {
    let near_end = duration.map_or(false, |d| end + end_delta >= d);
    ranges
        .iter()
        .any(|r| r.start <= start + MAX_GAP && (r.end >= end || near_end))
}

/// Spans buffered in every source
///
/// Used when several streams must all have data (audio and video together).
pub fn intersect_buffered_ranges(sources: &[Vec<BufferedRange>]) -> Vec<BufferedRange> {
    let Some((first, rest)) = sources.split_first() else {
        return Vec::new();
    };
    let mut accumulated = first.clone();
    for source in rest {
        let mut merged = Vec::new();
        let (mut a, mut b) = (0, 0);
        while a < accumulated.len() && b < source.len() {
            let start = accumulated[a].start.max(source[b].start);
            let end = accumulated[a].end.min(source[b].end);
            if end > start {
                merged.push(BufferedRange::new(start, end));
            }
            if accumulated[a].end < source[b].end {
                a += 1;
            } else {
                b += 1;
            }
        }
        accumulated = merged;
    }
    accumulated
}

/// Playback pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlaybackState {
    /// Waiting for initialization data
    Initializing,
    /// Paused by request
    Paused,
    /// Media time is advancing
    Playing,
    /// A seek is in progress; playback stays paused afterwards
    SeekingPause,
    /// A seek is in progress; playback resumes afterwards
    SeekingPlay,
    /// Playing, but waiting for data
    Stalled,
    /// Reached the end and waiting for a seek or play
    Ended,
    /// Stopped by an error; terminal
    Errored,
}

impl PlaybackState {
    pub fn is_seeking(self) -> bool {
        matches!(self, PlaybackState::SeekingPause | PlaybackState::SeekingPlay)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How much data is available around the playhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Strategy for [`FrameBuffer::get_frame`](super::FrameBuffer::get_frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLocation {
    /// Latest keyframe starting at or before the time
    KeyFrameBefore,
    /// Frame containing the time, else the closest one
    Near,
    /// First frame starting strictly after the time
    After,
}

/// Sort key of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrder {
    /// Presentation order (decoded frames)
    Pts,
    /// Decode order (encoded frames)
    Dts,
}

/// Audio sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    PackedU8,
    PackedS16,
    PackedS32,
    PackedS64,
    PackedFloat,
    PackedDouble,
    PlanarU8,
    PlanarS16,
    PlanarS32,
    PlanarS64,
    PlanarFloat,
    PlanarDouble,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        use SampleFormat::*;
        match self {
            PackedU8 | PlanarU8 => 1,
            PackedS16 | PlanarS16 => 2,
            PackedS32 | PlanarS32 | PackedFloat | PlanarFloat => 4,
            PackedS64 | PlanarS64 | PackedDouble | PlanarDouble => 8,
        }
    }

    pub fn is_planar(self) -> bool {
        use SampleFormat::*;
        matches!(
            self,
            PlanarU8 | PlanarS16 | PlanarS32 | PlanarS64 | PlanarFloat | PlanarDouble
        )
    }
}

/// Video pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Rgb24,
}

impl PixelFormat {
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 => 1,
        }
    }
}

/// Format of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    Audio(SampleFormat),
    Video(PixelFormat),
}

impl FrameFormat {
    pub fn is_planar(self) -> bool {
        match self {
            FrameFormat::Audio(format) => format.is_planar(),
            FrameFormat::Video(format) => format.plane_count() > 1,
        }
    }
}

/// Frame counters reported by the video renderer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VideoPlaybackQuality {
    pub total_video_frames: u64,
    pub dropped_video_frames: u64,
    pub corrupted_video_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_ahead() {
        let ranges = [BufferedRange::new(0.0, 5.0), BufferedRange::new(8.0, 12.0)];
        assert_eq!(buffered_ahead(&ranges, 2.0), 3.0);
        assert_eq!(buffered_ahead(&ranges, 6.0), 0.0);
        // Range starting just inside the gap tolerance still counts
        assert_eq!(buffered_ahead(&ranges, 7.9), 4.0);
        assert_eq!(buffered_ahead(&ranges, 20.0), 0.0);
        assert_eq!(buffered_ahead(&[], 0.0), 0.0);
    }

    fn ranges(spans: &[(f64, f64)]) -> Vec<BufferedRange> {
        spans.iter().map(|&(s, e)| BufferedRange::new(s, e)).collect()
    }

    #[test]
    fn test_intersect_buffered_ranges() {
        assert!(intersect_buffered_ranges(&[]).is_empty());
        assert!(intersect_buffered_ranges(&[vec![], vec![]]).is_empty());

        let both = ranges(&[(1.0, 4.0), (7.0, 10.0)]);
        assert_eq!(intersect_buffered_ranges(&[both.clone()]), both);
        assert_eq!(intersect_buffered_ranges(&[both.clone(), both.clone()]), both);

        let disjoint = intersect_buffered_ranges(&[ranges(&[(1.0, 4.0)]), ranges(&[(6.0, 10.0)])]);
        assert!(disjoint.is_empty());

        let partial = ranges(&[(2.0, 8.0)]);
        let expected = ranges(&[(2.0, 4.0), (7.0, 8.0)]);
        assert_eq!(intersect_buffered_ranges(&[both.clone(), partial.clone()]), expected);
        assert_eq!(intersect_buffered_ranges(&[partial, both]), expected);
    }

    #[test]
    fn test_intersect_three_sources() {
        let a = ranges(&[(2.0, 8.0)]);
        let b = ranges(&[(0.0, 6.0), (7.0, 9.0)]);
        let c = ranges(&[(3.0, 4.0), (5.0, 6.0), (7.0, 9.0)]);
        let expected = ranges(&[(3.0, 4.0), (5.0, 6.0), (7.0, 8.0)]);
        assert_eq!(intersect_buffered_ranges(&[a.clone(), b.clone(), c.clone()]), expected);
        assert_eq!(intersect_buffered_ranges(&[c, a, b]), expected);
    }

    #[test]
    fn test_is_buffered_until() {
        let ranges = [BufferedRange::new(0.0, 5.0)];
        assert!(is_buffered_until(&ranges, 1.0, 4.0, None, 0.1));
        assert!(!is_buffered_until(&ranges, 1.0, 6.0, None, 0.1));
        assert!(is_buffered_until(&ranges, 1.0, 6.0, Some(6.05), 0.1));
        assert!(!is_buffered_until(&ranges, 5.5, 5.5, Some(100.0), 0.1));
    }

    #[test]
    fn test_sample_format_sizes() {
        assert_eq!(SampleFormat::PackedU8.bytes_per_sample(), 1);
        assert_eq!(SampleFormat::PlanarS16.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::PackedFloat.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::PlanarDouble.bytes_per_sample(), 8);
        assert!(SampleFormat::PlanarS32.is_planar());
        assert!(!SampleFormat::PackedS32.is_planar());
        assert!(FrameFormat::Video(PixelFormat::Nv12).is_planar());
        assert!(!FrameFormat::Video(PixelFormat::Rgb24).is_planar());
    }

    #[test]
    fn test_ready_state_ordering() {
        assert!(ReadyState::HaveEnoughData > ReadyState::HaveFutureData);
        assert!(ReadyState::HaveMetadata > ReadyState::HaveNothing);
    }
}
