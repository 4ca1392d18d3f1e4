//! Error types for the media pipeline
//!
//! Decoder, demuxer, decryptor and device capabilities report failures with
//! [`MediaError`]. Only [`MediaError::KeyNotFound`] is recoverable inside the
//! engine; every other variant stops the worker that hit it.

use thiserror::Error;

/// Pipeline-level error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// Decryption key for the frame is not (yet) available
    #[error("Decryption key not found")]
    KeyNotFound,

    /// Frame is encrypted but no decryptor was supplied
    #[error("Encrypted frame without a decryptor")]
    NoDecryptor,

    /// Decryption failed for a reason other than a missing key
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    /// Codec configuration data was rejected
    #[error("Invalid codec data: {0}")]
    InvalidCodecData(String),

    /// The decoder could not be initialized for the stream
    #[error("Decoder failed to initialize: {0}")]
    DecoderFailedInit(String),

    /// The decoder rejected a frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// Container bytes could not be parsed
    #[error("Invalid container data: {0}")]
    InvalidContainerData(String),

    /// Output device failure
    #[error("Device error: {0}")]
    Device(String),

    /// Operation needs a component that is not attached
    #[error("Not attached: {0}")]
    NotAttached(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// True for errors a worker retries instead of stopping on
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MediaError::KeyNotFound)
    }
}

impl From<frameline_common::Error> for MediaError {
    fn from(err: frameline_common::Error) -> Self {
        MediaError::Internal(err.to_string())
    }
}

/// Convenience Result type using MediaError
pub type MediaResult<T> = std::result::Result<T, MediaError>;
