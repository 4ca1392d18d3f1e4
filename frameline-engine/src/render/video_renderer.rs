//! Video frame selection
//!
//! The drawing side is owned by the caller: it asks for the frame to show now
//! and how long to wait before asking again. Frames skipped between two draws
//! are counted as dropped.

use crate::media::{
    ClientId, DecodedFrame, DecodedStream, Frame, FrameLocation, PipelineClient, PlayerClock,
    VideoPlaybackQuality,
};
use frameline_common::sync::TrackedMutex;
use frameline_common::SyncContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Shortest wait between draws (120 fps)
pub const MIN_VIDEO_DELAY: f64 = 1.0 / 120.0;

/// Longest wait between draws (15 fps)
pub const MAX_VIDEO_DELAY: f64 = 1.0 / 15.0;

/// How frames are scaled into the drawing area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoFillMode {
    /// Letterbox to keep the aspect ratio
    #[default]
    MaintainRatio,
    /// Fill the area, distorting if needed
    Stretch,
    /// Fill the area, cropping to keep the aspect ratio
    Zoom,
}

struct State {
    player: Option<Arc<dyn PlayerClock>>,
    input: Option<Arc<DecodedStream>>,
    quality: VideoPlaybackQuality,
    fill_mode: VideoFillMode,
    /// Pts of the last frame returned; negative until the first draw after a seek
    prev_time: f64,
}

struct Shared {
    state: TrackedMutex<State>,
}

impl PipelineClient for Shared {
    fn on_seeking(&self) {
        self.state.lock().prev_time = -1.0;
    }
}

/// Picks frames for a video sink and tracks playback quality
pub struct VideoRendererCommon {
    shared: Arc<Shared>,
    registration: Option<(Arc<dyn PlayerClock>, ClientId)>,
}

impl VideoRendererCommon {
    pub fn new(ctx: &SyncContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: TrackedMutex::new(
                    "VideoRenderer",
                    Arc::clone(ctx.tracker()),
                    State {
                        player: None,
                        input: None,
                        quality: VideoPlaybackQuality::default(),
                        fill_mode: VideoFillMode::default(),
                        prev_time: -1.0,
                    },
                ),
            }),
            registration: None,
        }
    }

    pub fn set_player(&mut self, player: Option<Arc<dyn PlayerClock>>) {
        if let Some((old, id)) = self.registration.take() {
            old.remove_client(id);
        }
        if let Some(player) = &player {
            let id = player.add_client(Arc::clone(&self.shared) as Arc<dyn PipelineClient>);
            self.registration = Some((Arc::clone(player), id));
        }
        self.shared.state.lock().player = player;
    }

    pub fn attach(&self, input: Arc<DecodedStream>) {
        self.shared.state.lock().input = Some(input);
    }

    pub fn detach(&self) {
        self.shared.state.lock().input = None;
    }

    /// Frame to draw now, and seconds until the next call
    ///
    /// Returns no frame while seeking or when nothing is buffered; the caller
    /// keeps showing whatever it drew last.
    pub fn get_current_frame(&self) -> (Option<Arc<DecodedFrame>>, f64) {
        let mut state = self.shared.state.lock();
        let (Some(player), Some(input)) = (state.player.clone(), state.input.clone()) else {
            return (None, MIN_VIDEO_DELAY);
        };
        if player.playback_state().is_seeking() {
            return (None, MIN_VIDEO_DELAY);
        }

        let time = player.current_time();
        let Some(ideal) = input.get_frame(time, FrameLocation::Near) else {
            return (None, MIN_VIDEO_DELAY);
        };

        let total_delay = input
            .get_frame(ideal.pts(), FrameLocation::After)
            .map_or(0.0, |next| next.pts() - time);
        let delay = total_delay.clamp(MIN_VIDEO_DELAY, MAX_VIDEO_DELAY);

        if state.prev_time >= 0.0 {
            let skipped = input.count_frames_between(state.prev_time, ideal.pts()) as u64;
            if skipped > 0 {
                trace!("Dropped {} video frames before pts={:.3}", skipped, ideal.pts());
            }
            state.quality.dropped_video_frames += skipped;
            state.quality.total_video_frames += skipped;
            if ideal.pts() != state.prev_time {
                state.quality.total_video_frames += 1;
            }
        } else {
            state.quality.total_video_frames += 1;
        }
        state.prev_time = ideal.pts();

        (Some(ideal), delay)
    }

    pub fn video_playback_quality(&self) -> VideoPlaybackQuality {
        self.shared.state.lock_shared().quality
    }

    pub fn fill_mode(&self) -> VideoFillMode {
        self.shared.state.lock_shared().fill_mode
    }

    pub fn set_fill_mode(&self, mode: VideoFillMode) {
        self.shared.state.lock().fill_mode = mode;
    }

    /// Forget the last drawn frame so the next draw does not count drops
    pub fn on_seeking(&self) {
        self.shared.on_seeking();
    }
}

impl Drop for VideoRendererCommon {
    fn drop(&mut self) {
        if let Some((player, id)) = self.registration.take() {
            player.remove_client(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_mode_defaults_to_maintain_ratio() {
        let renderer = VideoRendererCommon::new(&SyncContext::new());
        assert_eq!(renderer.fill_mode(), VideoFillMode::MaintainRatio);
        renderer.set_fill_mode(VideoFillMode::Zoom);
        assert_eq!(renderer.fill_mode(), VideoFillMode::Zoom);
    }

    #[test]
    fn test_no_player_returns_min_delay() {
        let ctx = SyncContext::new();
        let renderer = VideoRendererCommon::new(&ctx);
        renderer.attach(Arc::new(DecodedStream::decoded(&ctx)));
        let (frame, delay) = renderer.get_current_frame();
        assert!(frame.is_none());
        assert_eq!(delay, MIN_VIDEO_DELAY);
        assert_eq!(renderer.video_playback_quality().total_video_frames, 0);
    }
}
