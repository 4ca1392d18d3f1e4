//! Interval-indexed frame buffer
//!
//! Frames are kept sorted by one timestamp (PTS or DTS, fixed per buffer) and
//! grouped into buffered ranges: runs in which each frame reaches to within
//! [`MAX_GAP`] of the next. Ranges never overlap and are reported in PTS.
//!
//! All operations take the buffer mutex for the whole call; queries use the
//! shared mode so renderers and the monitor do not serialize behind each other.

use super::frames::{DecodedFrame, EncodedFrame, Frame};
use super::types::{BufferedRange, FrameLocation, FrameOrder, MAX_GAP};
use frameline_common::sync::TrackedMutex;
use frameline_common::SyncContext;
use std::sync::Arc;
use tracing::debug;

struct Range<F> {
    /// Never empty
    frames: Vec<Arc<F>>,
    start_pts: f64,
    end_pts: f64,
}

impl<F: Frame> Range<F> {
    fn new(frame: Arc<F>) -> Self {
        Self {
            start_pts: frame.pts(),
            end_pts: frame.pts() + frame.duration(),
            frames: vec![frame],
        }
    }

    fn from_frames(frames: Vec<Arc<F>>) -> Self {
        let mut range = Self {
            frames,
            start_pts: f64::INFINITY,
            end_pts: f64::NEG_INFINITY,
        };
        range.update_pts();
        range
    }

    fn first(&self) -> &Arc<F> {
        &self.frames[0]
    }

    fn last(&self) -> &Arc<F> {
        &self.frames[self.frames.len() - 1]
    }

    fn update_pts(&mut self) {
        self.start_pts = f64::INFINITY;
        self.end_pts = f64::NEG_INFINITY;
        for frame in &self.frames {
            self.start_pts = self.start_pts.min(frame.pts());
            self.end_pts = self.end_pts.max(frame.pts() + frame.duration());
        }
    }
}

/// Thread-safe sorted frame store
pub struct FrameBuffer<F: Frame> {
    order: FrameOrder,
    ranges: TrackedMutex<Vec<Range<F>>>,
}

/// Encoded frames in decode order
pub type ElementaryStream = FrameBuffer<EncodedFrame>;

/// Decoded frames in presentation order
pub type DecodedStream = FrameBuffer<DecodedFrame>;

impl FrameBuffer<EncodedFrame> {
    pub fn encoded(ctx: &SyncContext) -> Self {
        Self::new("ElementaryStream", FrameOrder::Dts, ctx)
    }
}

impl FrameBuffer<DecodedFrame> {
    pub fn decoded(ctx: &SyncContext) -> Self {
        Self::new("DecodedStream", FrameOrder::Pts, ctx)
    }
}

impl<F: Frame> FrameBuffer<F> {
    pub fn new(name: &str, order: FrameOrder, ctx: &SyncContext) -> Self {
        Self {
            order,
            ranges: TrackedMutex::new(name, Arc::clone(ctx.tracker()), Vec::new()),
        }
    }

    pub fn order(&self) -> FrameOrder {
        self.order
    }

    /// Insert `frame` in sort order
    ///
    /// A frame with the same sort key as an existing one replaces it. Ranges
    /// whose gap the frame closes are merged.
    pub fn add_frame(&self, frame: Arc<F>) {
        let mut ranges = self.ranges.lock();

        match ranges
            .iter()
            .position(|r| self.extends_past(r.last(), &frame))
        {
            None => ranges.push(Range::new(frame)),
            Some(idx) if !self.extends_past(&frame, ranges[idx].first()) => {
                ranges.insert(idx, Range::new(frame));
            }
            Some(idx) => {
                let key = self.key(&frame);
                let range = &mut ranges[idx];
                let pos = self.lower_bound(&range.frames, key);
                range.start_pts = range.start_pts.min(frame.pts());
                range.end_pts = range.end_pts.max(frame.pts() + frame.duration());
                if pos < range.frames.len() && self.key(&range.frames[pos]) == key {
                    range.frames[pos] = frame;
                } else {
                    range.frames.insert(pos, frame);
                }
            }
        }

        let mut i = 1;
        while i < ranges.len() {
            if self.extends_past(ranges[i - 1].last(), ranges[i].first()) {
                let next = ranges.remove(i);
                let prev = &mut ranges[i - 1];
                prev.start_pts = prev.start_pts.min(next.start_pts);
                prev.end_pts = prev.end_pts.max(next.end_pts);
                prev.frames.extend(next.frames);
            } else {
                i += 1;
            }
        }

        self.assert_sorted(&ranges);
    }

    /// Locate a frame relative to `time` (in this buffer's sort key)
    pub fn get_frame(&self, time: f64, location: FrameLocation) -> Option<Arc<F>> {
        let ranges = self.ranges.lock_shared();

        let idx = match ranges.iter().position(|r| self.key(r.last()) >= time) {
            Some(idx) => idx,
            None if location == FrameLocation::After || ranges.is_empty() => return None,
            None => ranges.len() - 1,
        };
        let frames = &ranges[idx].frames;
        let pos = self.lower_bound(frames, time);

        match location {
            FrameLocation::After => {
                if pos < frames.len() && self.key(&frames[pos]) > time {
                    Some(Arc::clone(&frames[pos]))
                } else if pos + 1 < frames.len() {
                    Some(Arc::clone(&frames[pos + 1]))
                } else {
                    ranges.get(idx + 1).map(|r| Arc::clone(r.first()))
                }
            }

            FrameLocation::Near => {
                if pos == frames.len() {
                    return frames.last().cloned();
                }
                let next = &frames[pos];
                let prev = if pos > 0 {
                    &frames[pos - 1]
                } else if idx > 0 {
                    ranges[idx - 1].last()
                } else {
                    next
                };
                // Distance to the previous frame is measured from its end
                let prev_diff = time - self.key(prev) - prev.duration();
                let diff = self.key(next) - time;
                if prev_diff < diff && diff != 0.0 {
                    Some(Arc::clone(prev))
                } else {
                    Some(Arc::clone(next))
                }
            }

            FrameLocation::KeyFrameBefore => {
                let mut i = if pos == frames.len() {
                    frames.len() - 1
                } else if pos > 0 && self.key(&frames[pos]) > time {
                    pos - 1
                } else {
                    pos
                };
                while !frames[i].is_key_frame() {
                    if i == 0 {
                        return None;
                    }
                    i -= 1;
                }
                (self.key(&frames[i]) <= time).then(|| Arc::clone(&frames[i]))
            }
        }
    }

    /// Buffered ranges in PTS, sorted and non-overlapping
    pub fn get_buffered_ranges(&self) -> Vec<BufferedRange> {
        self.ranges
            .lock_shared()
            .iter()
            .map(|r| BufferedRange::new(r.start_pts, r.end_pts))
            .collect()
    }

    /// Number of frames whose start lies strictly between `start` and `end`
    pub fn count_frames_between(&self, start: f64, end: f64) -> usize {
        if end <= start {
            return 0;
        }
        let ranges = self.ranges.lock_shared();
        let first = match ranges.iter().position(|r| self.key(r.last()) >= start) {
            Some(idx) => idx,
            None => return 0,
        };

        let mut count = 0;
        for range in &ranges[first..] {
            let s = self.lower_bound(&range.frames, start);
            let e = self.lower_bound(&range.frames, end);
            count += e - s;
            if s < e && self.key(&range.frames[s]) == start {
                count -= 1;
            }
            if e != range.frames.len() {
                break;
            }
        }
        count
    }

    /// Remove frames whose PTS is in `[start, end)`
    ///
    /// Removal continues past `end` until the next keyframe so no range is
    /// left starting on a frame that cannot be decoded. Always uses PTS, even
    /// for DTS-ordered buffers.
    pub fn remove(&self, start: f64, end: f64) {
        let mut ranges = self.ranges.lock();
        let mut removing = false;
        let mut i = 0;
        while i < ranges.len() {
            let len = ranges[i].frames.len();
            let mut del_start = if removing { 0 } else { len };
            let mut del_end = len;

            for (pos, frame) in ranges[i].frames.iter().enumerate() {
                if !removing {
                    if frame.pts() >= start && frame.pts() < end {
                        removing = true;
                        del_start = pos;
                    }
                } else if frame.pts() >= end && frame.is_key_frame() {
                    del_end = pos;
                    removing = false;
                    break;
                }
            }

            if del_start != 0 && del_start != len && del_end != len {
                // Removed from the middle: split in two
                let range = &mut ranges[i];
                let tail = range.frames.split_off(del_end);
                range.frames.truncate(del_start);
                range.update_pts();
                ranges.insert(i + 1, Range::from_frames(tail));
                i += 2;
            } else {
                ranges[i].frames.drain(del_start..del_end);
                if ranges[i].frames.is_empty() {
                    ranges.remove(i);
                } else {
                    ranges[i].update_pts();
                    i += 1;
                }
            }
        }

        self.assert_sorted(&ranges);
    }

    pub fn clear(&self) {
        self.ranges.lock().clear();
    }

    /// Sum of the frames' size estimates
    pub fn estimate_size(&self) -> usize {
        self.ranges
            .lock_shared()
            .iter()
            .flat_map(|r| r.frames.iter())
            .map(|f| f.estimate_size())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.ranges.lock_shared().iter().map(|r| r.frames.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.lock_shared().is_empty()
    }

    /// Log the buffered ranges (and every frame if `all_frames`)
    pub fn debug_dump(&self, all_frames: bool) {
        let ranges = self.ranges.lock_shared();
        debug!("{} ordered by {:?}:", self.ranges.name(), self.order);
        if ranges.is_empty() {
            debug!("  Nothing buffered");
        }
        for (i, range) in ranges.iter().enumerate() {
            debug!("  Range[{}]: {:.2}-{:.2}", i, range.start_pts, range.end_pts);
            if all_frames {
                for (j, frame) in range.frames.iter().enumerate() {
                    debug!(
                        "    Frame[{}]: is_key_frame={:<5}, pts={:.2}, dts={:.2}",
                        j,
                        frame.is_key_frame(),
                        frame.pts(),
                        frame.dts()
                    );
                }
            }
        }
    }

    fn key(&self, frame: &F) -> f64 {
        match self.order {
            FrameOrder::Pts => frame.pts(),
            FrameOrder::Dts => frame.dts(),
        }
    }

    /// True if `a` reaches to within the gap tolerance of `b`'s start
    fn extends_past(&self, a: &F, b: &F) -> bool {
        self.key(a) + a.duration() + MAX_GAP >= self.key(b)
    }

    /// Index of the first frame whose key is not less than `time`
    ///
    /// Scans from whichever end of the range is closer, so appending at the
    /// end is O(1).
    fn lower_bound(&self, frames: &[Arc<F>], time: f64) -> usize {
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return 0;
        };
        if time - self.key(first) < self.key(last) - time {
            frames
                .iter()
                .position(|f| self.key(f) >= time)
                .unwrap_or(frames.len())
        } else {
            frames
                .iter()
                .rposition(|f| self.key(f) < time)
                .map_or(0, |i| i + 1)
        }
    }

    #[cfg(debug_assertions)]
    fn assert_sorted(&self, ranges: &[Range<F>]) {
        for range in ranges {
            debug_assert!(!range.frames.is_empty());
            debug_assert!(range.start_pts <= range.end_pts);
            debug_assert!(range
                .frames
                .windows(2)
                .all(|w| self.key(&w[0]) <= self.key(&w[1])));
        }
    }

    #[cfg(not(debug_assertions))]
    fn assert_sorted(&self, _ranges: &[Range<F>]) {}
}
