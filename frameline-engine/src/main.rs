//! Frameline simulator (frameline-sim) - Main entry point
//!
//! Runs the media pipeline end to end against synthetic demuxer, decoder and
//! audio device back ends, then prints a TOML report of the run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use frameline_common::config::load_config_with_source;
use frameline_common::logging::init_tracing;
use frameline_engine::sim::{run_simulation, SimOptions};

/// Command-line arguments for frameline-sim
#[derive(Parser, Debug)]
#[command(name = "frameline-sim")]
#[command(about = "Play synthetic media through the Frameline pipeline")]
#[command(version)]
struct Args {
    /// Config file (overrides FRAMELINE_CONFIG and the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Media duration in seconds
    #[arg(short, long, default_value = "3.0")]
    duration: f64,

    /// Seconds of media per appended segment
    #[arg(long, default_value = "1.0")]
    segment_length: f64,

    /// Audio only
    #[arg(long)]
    no_video: bool,

    /// Log filter when RUST_LOG is unset (defaults to the config value)
    #[arg(long, env = "FRAMELINE_LOG")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (config, source) =
        load_config_with_source(args.config.as_deref()).context("Failed to load configuration")?;
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level);
    source.log();

    if !(args.duration.is_finite() && args.duration > 0.0) {
        anyhow::bail!("--duration must be a positive number of seconds");
    }

    info!("Starting frameline-sim: {:.1}s of media", args.duration);
    let options = SimOptions {
        duration: args.duration,
        segment_length: args.segment_length,
        with_video: !args.no_video,
        timeout: Duration::from_secs_f64(args.duration * 3.0 + 5.0),
    };
    let report = run_simulation(&config.pipeline, &options).context("Simulation failed")?;

    let text = toml::to_string(&report).context("Failed to serialize report")?;
    println!("{}", text);

    if report.timed_out {
        anyhow::bail!("playback did not reach the end within {:?}", options.timeout);
    }
    Ok(())
}
