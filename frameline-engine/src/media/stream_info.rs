//! Elementary stream descriptor

use std::sync::Arc;
use uuid::Uuid;

/// Codec and layout of one elementary stream
///
/// Frames hold an `Arc<StreamInfo>`; a renderer treats frames from different
/// descriptors as a stream switch even when the fields match.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Unique per descriptor
    pub id: Uuid,
    pub mime_type: String,
    pub codec: String,
    pub is_video: bool,
    pub width: u32,
    pub height: u32,
    pub channel_count: u32,
    pub sample_rate: u32,
    /// Codec configuration bytes, passed through to the decoder
    pub extra_data: Vec<u8>,
}

impl StreamInfo {
    pub fn audio(codec: &str, sample_rate: u32, channel_count: u32) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            mime_type: format!("audio/{}", codec),
            codec: codec.to_string(),
            is_video: false,
            width: 0,
            height: 0,
            channel_count,
            sample_rate,
            extra_data: Vec::new(),
        })
    }

    pub fn video(codec: &str, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            mime_type: format!("video/{}", codec),
            codec: codec.to_string(),
            is_video: true,
            width,
            height,
            channel_count: 0,
            sample_rate: 0,
            extra_data: Vec::new(),
        })
    }
}
