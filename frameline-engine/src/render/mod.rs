//! Render-side consumers of decoded streams

pub mod audio_renderer;
pub mod video_renderer;

pub use audio_renderer::{sync_bytes, AudioRenderer};
pub use video_renderer::{VideoFillMode, VideoRendererCommon, MAX_VIDEO_DELAY, MIN_VIDEO_DELAY};
