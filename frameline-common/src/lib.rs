//! # Frameline Common Library
//!
//! Shared infrastructure for the Frameline media engine:
//! - Configuration loading
//! - Tracing setup
//! - Injectable clock
//! - Deadlock-checked synchronization primitives
//! - Priority task scheduler

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod sync;
pub mod task_runner;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{FramelineConfig, LoggingConfig, PipelineConfig};
pub use context::SyncContext;
pub use error::{Error, Result};
pub use task_runner::{TaskHandle, TaskId, TaskPriority, TaskRunner};
