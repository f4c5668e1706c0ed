//! synctraced - capture timing trace daemon
//!
//! This daemon:
//! 1. Enables a capture input for the configured display mode and pixel format
//! 2. Stamps every frame arrival against the wall clock and the device's
//!    reference clock
//! 3. Decodes the sync marker stripes and appends one log row per marked frame
//! 4. Queues marked frame payloads for the disk writer thread (when a video
//!    output is configured)
//! 5. Exits cleanly on SIGINT/SIGTERM/SIGHUP, at the frame cap, or when a late
//!    frame arrives under the abort policy

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use synctrace::{
    CaptureConfig, CaptureInput, CaptureSession, DisplayMode, LateFramePolicy, PixelFormat,
    SessionOptions, SyntheticConfig, SyntheticInput, ThroughputObserver, SYNTHETIC_SCHEME,
};

#[derive(Parser, Debug)]
#[command(
    name = "synctraced",
    about = "Trace capture timing and persist marked frames"
)]
struct Args {
    /// Capture device URI (synthetic://<name>).
    #[arg(long)]
    device: Option<String>,

    /// Display mode to request (e.g. 720p60).
    #[arg(long)]
    mode: Option<String>,

    /// Pixel format: yuv8, yuv10 or rgb10.
    #[arg(long)]
    pixel_format: Option<String>,

    /// Restart capture with a matching pixel format when the input changes.
    #[arg(long)]
    format_detection: bool,

    /// Write marked frame payloads to this file.
    #[arg(long, value_name = "PATH")]
    video_out: Option<PathBuf>,

    /// Write the timing log to this file instead of stdout.
    #[arg(long, value_name = "PATH")]
    log_out: Option<PathBuf>,

    /// Stop after this many frames (0 runs until signalled).
    #[arg(long, value_name = "COUNT")]
    max_frames: Option<u64>,

    /// Late-frame policy: abort or warn.
    #[arg(long, value_name = "POLICY")]
    late_policy: Option<String>,

    /// Late-frame threshold in reference clock ticks.
    #[arg(long, env = "SYNCTRACE_LATE_THRESHOLD", value_name = "TICKS")]
    late_threshold: Option<i64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = CaptureConfig::load()?;
    apply_args(&mut config, &args)?;

    let device = build_input(&config)?;
    if config.format_detection && !device.supports_format_detection() {
        return Err(anyhow!(
            "device {} does not support input format detection",
            config.device
        ));
    }
    if !device.supports_mode(&config.mode, config.pixel_format) {
        return Err(anyhow!(
            "device {} does not support mode {} at {}",
            config.device,
            config.mode.name,
            config.pixel_format.name()
        ));
    }

    let mut options = SessionOptions::new(config.mode.clone());
    options.pixel_format = config.pixel_format;
    options.format_detection = config.format_detection;
    options.max_frames = config.max_frames;
    options.late_policy = config.late_policy;
    options.late_threshold_ticks = config.late_threshold_ticks;
    options.video_out = config.video_out.clone();
    options.log_out = config.log_out.clone();
    options.observer = Some(Box::new(ThroughputObserver::default()));

    let mut session = CaptureSession::new(device, options)?;

    let shutdown = session.shutdown();
    ctrlc::set_handler(move || shutdown.raise()).expect("error setting Ctrl-C handler");

    log::info!(
        "synctraced running. device={} mode={} ({:.2} fps) format={}",
        config.device,
        config.mode.name,
        config.mode.fps(),
        config.pixel_format.name()
    );
    match &config.video_out {
        Some(path) => log::info!("writing marked frames to {}", path.display()),
        None => log::info!("video output disabled (timing log only)"),
    }
    match &config.log_out {
        Some(path) => log::info!("writing timing log to {}", path.display()),
        None => log::info!("writing timing log to stdout"),
    }
    if config.max_frames > 0 {
        log::info!("stopping after {} frames", config.max_frames);
    }
    log::info!(
        "late-frame policy: {} beyond {} ticks",
        config.late_policy.name(),
        config.late_threshold_ticks
    );

    let result = session.run();

    let stats = session.stats();
    log::info!(
        "captured {} frames: {} marked, {} without signal, {} dropped, {} late",
        stats.total_frames,
        stats.valid_frames,
        stats.no_signal_frames,
        stats.dropped_frames,
        stats.late_frames
    );
    log::info!(
        "writer: {} frames ({} bytes) written, {} write errors",
        stats.writer.frames_written,
        stats.writer.bytes_written,
        stats.writer.write_errors
    );
    if stats.log_write_errors > 0 {
        log::warn!("{} log rows failed to write", stats.log_write_errors);
    }

    result
}

/// Command-line flags override the file/env configuration.
fn apply_args(config: &mut CaptureConfig, args: &Args) -> Result<()> {
    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(mode) = &args.mode {
        config.mode = DisplayMode::by_name(mode).ok_or_else(|| {
            anyhow!(
                "unknown display mode '{}' (known modes: {})",
                mode,
                DisplayMode::known_names().join(", ")
            )
        })?;
    }
    if let Some(format) = &args.pixel_format {
        config.pixel_format = PixelFormat::parse(format)?;
    }
    if args.format_detection {
        config.format_detection = true;
    }
    if let Some(path) = &args.video_out {
        config.video_out = Some(path.clone());
    }
    if let Some(path) = &args.log_out {
        config.log_out = Some(path.clone());
    }
    if let Some(max_frames) = args.max_frames {
        config.max_frames = max_frames;
    }
    if let Some(policy) = &args.late_policy {
        config.late_policy = LateFramePolicy::parse(policy)?;
    }
    if let Some(ticks) = args.late_threshold {
        if ticks <= 0 {
            return Err(anyhow!("late threshold must be greater than zero ticks"));
        }
        config.late_threshold_ticks = ticks;
    }
    // Flags may re-point outputs after config validation ran.
    if let (Some(video), Some(log)) = (&config.video_out, &config.log_out) {
        if video == log {
            return Err(anyhow!("video output and log file must be different paths"));
        }
    }
    Ok(())
}

fn build_input(config: &CaptureConfig) -> Result<Arc<dyn CaptureInput>> {
    if config.device.starts_with(SYNTHETIC_SCHEME) {
        let synthetic = SyntheticInput::new(SyntheticConfig {
            device: config.device.clone(),
            marker_period: config.synthetic.marker_period,
            jitter_ticks: config.synthetic.jitter_ticks,
            dropout_period: config.synthetic.dropout_period,
        })?;
        return Ok(Arc::new(synthetic));
    }
    Err(anyhow!(
        "unsupported device URI '{}' (expected {}<name>)",
        config.device,
        SYNTHETIC_SCHEME
    ))
}
