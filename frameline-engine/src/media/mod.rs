//! Media data model: frames, frame buffers and capability traits

pub mod frame_buffer;
pub mod frames;
pub mod stream_info;
pub mod traits;
pub mod types;

pub use frame_buffer::{DecodedStream, ElementaryStream, FrameBuffer};
pub use frames::{DecodedFrame, EncodedFrame, EncryptionInfo, Frame, Subsample};
pub use stream_info::StreamInfo;
pub use traits::{AudioDevice, ClientId, Decoder, Decryptor, Demuxer, PipelineClient, PlayerClock};
pub use types::{
    buffered_ahead, intersect_buffered_ranges, is_buffered_until, BufferedRange, FrameFormat,
    FrameLocation, FrameOrder, PixelFormat, PlaybackState, ReadyState, SampleFormat,
    VideoPlaybackQuality, MAX_GAP,
};
