//! Encoded and decoded frames
//!
//! Frames are immutable once built and shared as `Arc`s between the buffers,
//! the workers and the renderers.

use super::stream_info::StreamInfo;
use super::traits::Decryptor;
use super::types::{FrameFormat, PixelFormat, SampleFormat};
use crate::error::{MediaError, MediaResult};
use std::borrow::Cow;
use std::mem;
use std::sync::Arc;

/// Timing and size accessors the frame buffer indexes on
pub trait Frame: Send + Sync + 'static {
    /// Presentation timestamp (seconds)
    fn pts(&self) -> f64;

    /// Decode timestamp (seconds)
    fn dts(&self) -> f64;

    /// Duration (seconds)
    fn duration(&self) -> f64;

    fn is_key_frame(&self) -> bool;

    /// Approximate memory held by the frame, in bytes
    fn estimate_size(&self) -> usize;
}

/// Clear/protected split of an encrypted sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsample {
    pub clear_bytes: u32,
    pub protected_bytes: u32,
}

/// Parameters a [`Decryptor`] needs for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    /// Empty means the whole payload is protected
    pub subsamples: Vec<Subsample>,
}

/// Compressed frame produced by a demuxer
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pts: f64,
    dts: f64,
    duration: f64,
    is_key_frame: bool,
    stream_info: Arc<StreamInfo>,
    data: Vec<u8>,
    encryption: Option<EncryptionInfo>,
}

impl EncodedFrame {
    pub fn new(
        stream_info: Arc<StreamInfo>,
        pts: f64,
        dts: f64,
        duration: f64,
        is_key_frame: bool,
        data: Vec<u8>,
    ) -> Self {
        Self {
            pts,
            dts,
            duration,
            is_key_frame,
            stream_info,
            data,
            encryption: None,
        }
    }

    pub fn with_encryption(mut self, info: EncryptionInfo) -> Self {
        self.encryption = Some(info);
        self
    }

    pub fn stream_info(&self) -> &Arc<StreamInfo> {
        &self.stream_info
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn encryption(&self) -> Option<&EncryptionInfo> {
        self.encryption.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Clear payload, decrypting through `decryptor` when the frame is protected
    pub fn decrypt(&self, decryptor: Option<&dyn Decryptor>) -> MediaResult<Cow<'_, [u8]>> {
        let Some(info) = &self.encryption else {
            return Ok(Cow::Borrowed(&self.data));
        };
        let decryptor = decryptor.ok_or(MediaError::NoDecryptor)?;
        decryptor.decrypt(info, &self.data).map(Cow::Owned)
    }
}

impl Frame for EncodedFrame {
    fn pts(&self) -> f64 {
        self.pts
    }

    fn dts(&self) -> f64 {
        self.dts
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    fn estimate_size(&self) -> usize {
        mem::size_of::<Self>() + self.data.len()
    }
}

/// Raw samples or pixels produced by a decoder
///
/// Packed audio has one plane; planar audio has one plane per channel. Video
/// planes follow [`PixelFormat::plane_count`]. Decoded frames are always
/// keyframes.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pts: f64,
    dts: f64,
    duration: f64,
    stream_info: Arc<StreamInfo>,
    format: FrameFormat,
    width: u32,
    height: u32,
    sample_count: u32,
    planes: Vec<Vec<u8>>,
    linesizes: Vec<usize>,
}

impl DecodedFrame {
    pub fn audio(
        stream_info: Arc<StreamInfo>,
        pts: f64,
        dts: f64,
        duration: f64,
        format: SampleFormat,
        sample_count: u32,
        planes: Vec<Vec<u8>>,
    ) -> Self {
        let linesizes = planes.iter().map(Vec::len).collect();
        Self {
            pts,
            dts,
            duration,
            stream_info,
            format: FrameFormat::Audio(format),
            width: 0,
            height: 0,
            sample_count,
            planes,
            linesizes,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn video(
        stream_info: Arc<StreamInfo>,
        pts: f64,
        dts: f64,
        duration: f64,
        format: PixelFormat,
        width: u32,
        height: u32,
        planes: Vec<Vec<u8>>,
        linesizes: Vec<usize>,
    ) -> Self {
        Self {
            pts,
            dts,
            duration,
            stream_info,
            format: FrameFormat::Video(format),
            width,
            height,
            sample_count: 0,
            planes,
            linesizes,
        }
    }

    pub fn stream_info(&self) -> &Arc<StreamInfo> {
        &self.stream_info
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Samples per channel (audio only)
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn planes(&self) -> &[Vec<u8>] {
        &self.planes
    }

    /// Bytes per row (video) or per plane (audio)
    pub fn linesizes(&self) -> &[usize] {
        &self.linesizes
    }
}

impl Frame for DecodedFrame {
    fn pts(&self) -> f64 {
        self.pts
    }

    fn dts(&self) -> f64 {
        self.dts
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn is_key_frame(&self) -> bool {
        true
    }

    fn estimate_size(&self) -> usize {
        let payload: usize = self.planes.iter().map(Vec::len).sum();
        mem::size_of::<Self>() + payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorDecryptor(u8);

    impl Decryptor for XorDecryptor {
        fn decrypt(&self, info: &EncryptionInfo, data: &[u8]) -> MediaResult<Vec<u8>> {
            if info.key_id != b"key" {
                return Err(MediaError::KeyNotFound);
            }
            Ok(data.iter().map(|b| b ^ self.0).collect())
        }
    }

    fn encryption(key: &[u8]) -> EncryptionInfo {
        EncryptionInfo {
            key_id: key.to_vec(),
            iv: vec![0; 16],
            subsamples: Vec::new(),
        }
    }

    #[test]
    fn test_clear_frame_borrows_payload() {
        let frame = EncodedFrame::new(StreamInfo::audio("pcm", 48000, 2), 0.0, 0.0, 0.1, true, vec![1, 2, 3]);
        let data = frame.decrypt(None).unwrap();
        assert!(matches!(data, Cow::Borrowed(_)));
        assert_eq!(&*data, &[1, 2, 3]);
    }

    #[test]
    fn test_encrypted_frame_needs_decryptor() {
        let frame = EncodedFrame::new(StreamInfo::audio("pcm", 48000, 2), 0.0, 0.0, 0.1, true, vec![1])
            .with_encryption(encryption(b"key"));
        assert_eq!(frame.decrypt(None).unwrap_err(), MediaError::NoDecryptor);

        let decryptor = XorDecryptor(0xff);
        assert_eq!(&*frame.decrypt(Some(&decryptor)).unwrap(), &[0xfe]);
    }

    #[test]
    fn test_missing_key_is_reported() {
        let frame = EncodedFrame::new(StreamInfo::video("h264", 640, 480), 0.0, 0.0, 0.04, true, vec![1])
            .with_encryption(encryption(b"other"));
        let err = frame.decrypt(Some(&XorDecryptor(1))).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_decoded_frames_are_keyframes() {
        let frame = DecodedFrame::audio(
            StreamInfo::audio("pcm", 2, 2),
            1.0,
            1.0,
            0.5,
            SampleFormat::PlanarS16,
            1,
            vec![vec![0; 2], vec![0; 2]],
        );
        assert!(frame.is_key_frame());
        assert_eq!(frame.linesizes(), &[2, 2]);
        assert_eq!(frame.estimate_size(), mem::size_of::<DecodedFrame>() + 4);
    }
}
