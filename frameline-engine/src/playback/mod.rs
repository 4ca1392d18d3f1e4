//! Playback control and producer threads
//!
//! - [`PipelineManager`]: playback state machine and media clock
//! - [`PipelineMonitor`]: drives stall/resume/end from buffered ranges
//! - [`DecoderThread`] / [`DemuxerThread`]: producer loops between frame buffers

pub mod decoder_thread;
pub mod demuxer_thread;
pub mod pipeline_manager;
pub mod pipeline_monitor;

pub use decoder_thread::{DecoderCallbacks, DecoderThread};
pub use demuxer_thread::{AppendCallback, DemuxErrorCallback, DemuxerThread};
pub use pipeline_manager::{PipelineManager, SeekCallback, StatusCallback};
pub use pipeline_monitor::{BufferedRangesFn, PipelineMonitor, ReadyStateCallback};
