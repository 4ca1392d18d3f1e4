//! Configuration loading and config file resolution
//!
//! Resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `FRAMELINE_CONFIG` environment variable
//! 3. Platform config file (`<config_dir>/frameline/config.toml`, then
//!    `/etc/frameline/config.toml` on Linux)
//! 4. Compiled defaults
//!
//! A missing file is not an error: defaults are used and a warning is logged.
//! A file that exists but does not parse is an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "FRAMELINE_CONFIG";

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramelineConfig {
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[pipeline]` section: buffering targets, thresholds and backoffs
///
/// Times are in seconds unless the field name says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Decoded data kept ahead of the playhead before the decoder idles
    pub decode_buffer_ahead: f64,
    /// Encoded data kept ahead of the playhead before the demuxer idles
    pub demux_buffer_ahead: f64,
    /// Decoded frames further than this behind the playhead are evicted
    pub eviction_behind: f64,
    /// Distance to the end of the stream that counts as "at the end"
    pub end_delta: f64,
    /// Sleep when a worker has no input
    pub no_data_backoff_ms: u64,
    /// Sleep after a decrypt key was missing
    pub missing_key_backoff_ms: u64,
    /// Pipeline monitor poll interval
    pub monitor_poll_ms: u64,
    /// Buffered-ahead amount needed to leave the stalled state
    pub need_for_play: f64,
    /// Buffered-ahead amount that counts as "enough data"
    pub need_for_enough: f64,
    /// Audio kept queued in the device
    pub audio_buffer_target: f64,
    /// Audio drift tolerated before inserting silence or dropping samples
    pub audio_sync_limit: f64,
    /// Sleep when a renderer finds no frame to play
    pub render_no_data_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decode_buffer_ahead: 1.0,
            demux_buffer_ahead: 30.0,
            eviction_behind: 3.0,
            end_delta: 0.1,
            no_data_backoff_ms: 25,
            missing_key_backoff_ms: 100,
            monitor_poll_ms: 10,
            need_for_play: 0.3,
            need_for_enough: 2.0,
            audio_buffer_target: 2.0,
            audio_sync_limit: 0.1,
            render_no_data_backoff_ms: 100,
        }
    }
}

impl PipelineConfig {
    pub fn no_data_backoff(&self) -> Duration {
        Duration::from_millis(self.no_data_backoff_ms)
    }

    pub fn missing_key_backoff(&self) -> Duration {
        Duration::from_millis(self.missing_key_backoff_ms)
    }

    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_ms)
    }

    pub fn render_no_data_backoff(&self) -> Duration {
        Duration::from_millis(self.render_no_data_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("decode_buffer_ahead", self.decode_buffer_ahead),
            ("demux_buffer_ahead", self.demux_buffer_ahead),
            ("need_for_play", self.need_for_play),
            ("need_for_enough", self.need_for_enough),
            ("audio_buffer_target", self.audio_buffer_target),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::Config(format!(
                    "pipeline.{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        let non_negative = [
            ("eviction_behind", self.eviction_behind),
            ("end_delta", self.end_delta),
            ("audio_sync_limit", self.audio_sync_limit),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::Config(format!(
                    "pipeline.{} must not be negative, got {}",
                    name, value
                )));
            }
        }
        if self.need_for_enough < self.need_for_play {
            return Err(Error::Config(
                "pipeline.need_for_enough must be >= pipeline.need_for_play".to_string(),
            ));
        }
        if self.monitor_poll_ms == 0 {
            return Err(Error::Config("pipeline.monitor_poll_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

impl FramelineConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FramelineConfig = toml::from_str(text)?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Pick the config file path by priority; `None` means use defaults
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config file
    platform_config_file()
}

/// Where [`load_config_with_source`] found its settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Parsed from this file
    File(PathBuf),
    /// This file was named but does not exist; defaults apply
    Missing(PathBuf),
    /// No file was named or found; defaults apply
    Defaults,
}

impl ConfigSource {
    /// Report the outcome through `tracing`
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
            ConfigSource::Missing(path) => {
                warn!("Config file {} not found, using defaults", path.display())
            }
            ConfigSource::Defaults => info!("No config file found, using defaults"),
        }
    }
}

/// Resolve, read and parse the configuration without logging
///
/// For callers that set up logging from the loaded config and report the
/// source afterwards.
pub fn load_config_with_source(cli_arg: Option<&Path>) -> Result<(FramelineConfig, ConfigSource)> {
    let Some(path) = resolve_config_path(cli_arg) else {
        return Ok((FramelineConfig::default(), ConfigSource::Defaults));
    };
    if !path.exists() {
        return Ok((FramelineConfig::default(), ConfigSource::Missing(path)));
    }
    let config = FramelineConfig::from_file(&path)?;
    Ok((config, ConfigSource::File(path)))
}

/// Resolve, read and parse the configuration
pub fn load_config(cli_arg: Option<&Path>) -> Result<FramelineConfig> {
    let (config, source) = load_config_with_source(cli_arg)?;
    source.log();
    Ok(config)
}

fn platform_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("frameline").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/frameline/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}
