//! Common error types for Frameline

use thiserror::Error;

/// Common result type for Frameline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the engine crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The event was reset or dropped before its provider signalled it
    #[error("Event abandoned: {0}")]
    Abandoned(String),

    /// A scheduled task was dropped before it ran (scheduler shut down)
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    /// Timed out waiting for an event
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Operation on a component that has already been stopped
    #[error("Stopped: {0}")]
    Stopped(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
