//! Capabilities the pipeline consumes and exposes
//!
//! Codec, container, decryption and output back ends plug in through these
//! traits. The pipeline itself implements [`PlayerClock`] for the renderers.

use super::frames::{DecodedFrame, EncodedFrame, EncryptionInfo};
use super::types::PlaybackState;
use crate::error::MediaResult;
use std::sync::Arc;

/// Decrypts protected frame payloads
pub trait Decryptor: Send + Sync {
    /// Return the clear payload, or [`MediaError::KeyNotFound`](crate::MediaError::KeyNotFound)
    /// while the key for `info.key_id` is unavailable
    fn decrypt(&self, info: &EncryptionInfo, data: &[u8]) -> MediaResult<Vec<u8>>;
}

/// Turns encoded frames into decoded ones
pub trait Decoder: Send + Sync {
    /// Decode one frame; `None` flushes any frames the decoder still holds
    fn decode(
        &mut self,
        frame: Option<&EncodedFrame>,
        decryptor: Option<&dyn Decryptor>,
    ) -> MediaResult<Vec<Arc<DecodedFrame>>>;

    /// Drop internal state before decoding from a new keyframe
    fn reset_decoder(&mut self);
}

/// Splits container bytes into encoded frames
pub trait Demuxer: Send + Sync {
    /// Parse one appended segment; `timestamp_offset` is added to every timestamp
    fn demux(&mut self, timestamp_offset: f64, data: &[u8]) -> MediaResult<Vec<Arc<EncodedFrame>>>;

    /// Forget partial data and initialization state
    fn reset(&mut self);
}

/// Platform audio output driven by the audio renderer
pub trait AudioDevice: Send + Sync {
    /// (Re)open the device for the format of `frame`
    fn init_device(&mut self, frame: &DecodedFrame, volume: f64) -> MediaResult<()>;

    /// Queue interleaved sample bytes
    fn append_buffer(&mut self, data: &[u8]) -> MediaResult<()>;

    /// Drop everything queued
    fn clear_buffer(&mut self);

    /// Bytes queued but not yet played
    fn bytes_buffered(&self) -> usize;

    fn set_device_state(&mut self, playing: bool);

    fn update_volume(&mut self, volume: f64);
}

/// Receives pipeline notifications
///
/// Called on the thread that changed the pipeline, without pipeline locks
/// held.
pub trait PipelineClient: Send + Sync {
    fn on_playback_state_changed(&self, _old: PlaybackState, _new: PlaybackState) {}

    fn on_playback_rate_changed(&self, _old: f64, _new: f64) {}

    fn on_seeking(&self) {}
}

/// Registration handle returned by [`PlayerClock::add_client`]
pub type ClientId = u64;

/// Read-only view of the pipeline used by renderers
pub trait PlayerClock: Send + Sync {
    fn current_time(&self) -> f64;

    fn playback_rate(&self) -> f64;

    fn playback_state(&self) -> PlaybackState;

    fn add_client(&self, client: Arc<dyn PipelineClient>) -> ClientId;

    fn remove_client(&self, id: ClientId);
}
