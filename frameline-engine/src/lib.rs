//! # Frameline Engine
//!
//! Media pipeline core: interval frame buffers, the playback state machine,
//! demux/decode producer threads and renderer synchronization.
//!
//! **Data flow:** demuxer thread → [`ElementaryStream`] → decoder thread →
//! [`DecodedStream`] → renderers, all timed by the [`PipelineManager`] and
//! driven between stalled/playing/ended by the [`PipelineMonitor`].
//!
//! Codec, container, decryption and output back ends are pluggable through
//! the traits in [`media`]. [`sim`] provides synthetic ones for end-to-end runs.

pub mod error;
pub mod media;
pub mod playback;
pub mod render;
pub mod sim;

pub use error::{MediaError, MediaResult};
pub use media::{DecodedStream, ElementaryStream, FrameBuffer};
pub use playback::{DecoderThread, DemuxerThread, PipelineManager, PipelineMonitor};
pub use render::{AudioRenderer, VideoRendererCommon};
