use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frame::{DisplayMode, PixelFormat};
use crate::timing::{LateFramePolicy, DEFAULT_LATE_THRESHOLD_TICKS};

const DEFAULT_DEVICE: &str = "synthetic://capture";
const DEFAULT_MODE: &str = "720p60";
const DEFAULT_PIXEL_FORMAT: &str = "yuv8";
const DEFAULT_MARKER_PERIOD: u64 = 1;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    mode: Option<String>,
    pixel_format: Option<String>,
    format_detection: Option<bool>,
    video_out: Option<PathBuf>,
    log_out: Option<PathBuf>,
    max_frames: Option<u64>,
    late: Option<LateConfigFile>,
    synthetic: Option<SyntheticConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct LateConfigFile {
    policy: Option<String>,
    threshold_ticks: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct SyntheticConfigFile {
    marker_period: Option<u64>,
    jitter_ticks: Option<i64>,
    dropout_period: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: String,
    pub mode: DisplayMode,
    pub pixel_format: PixelFormat,
    pub format_detection: bool,
    pub video_out: Option<PathBuf>,
    pub log_out: Option<PathBuf>,
    pub max_frames: u64,
    pub late_policy: LateFramePolicy,
    pub late_threshold_ticks: i64,
    pub synthetic: SyntheticSettings,
}

#[derive(Debug, Clone)]
pub struct SyntheticSettings {
    pub marker_period: u64,
    pub jitter_ticks: i64,
    pub dropout_period: u64,
}

impl CaptureConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SYNCTRACE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let device = file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string());
        let mode = lookup_mode(file.mode.as_deref().unwrap_or(DEFAULT_MODE))?;
        let pixel_format = PixelFormat::parse(
            file.pixel_format
                .as_deref()
                .unwrap_or(DEFAULT_PIXEL_FORMAT),
        )?;
        let format_detection = file.format_detection.unwrap_or(false);
        let max_frames = file.max_frames.unwrap_or(0);
        let late_policy = match file.late.as_ref().and_then(|late| late.policy.as_deref()) {
            Some(policy) => LateFramePolicy::parse(policy)?,
            None => LateFramePolicy::default(),
        };
        let late_threshold_ticks = file
            .late
            .and_then(|late| late.threshold_ticks)
            .unwrap_or(DEFAULT_LATE_THRESHOLD_TICKS);
        let synthetic = SyntheticSettings {
            marker_period: file
                .synthetic
                .as_ref()
                .and_then(|synthetic| synthetic.marker_period)
                .unwrap_or(DEFAULT_MARKER_PERIOD),
            jitter_ticks: file
                .synthetic
                .as_ref()
                .and_then(|synthetic| synthetic.jitter_ticks)
                .unwrap_or(0),
            dropout_period: file
                .synthetic
                .and_then(|synthetic| synthetic.dropout_period)
                .unwrap_or(0),
        };
        Ok(Self {
            device,
            mode,
            pixel_format,
            format_detection,
            video_out: file.video_out,
            log_out: file.log_out,
            max_frames,
            late_policy,
            late_threshold_ticks,
            synthetic,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("SYNCTRACE_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Ok(mode) = std::env::var("SYNCTRACE_MODE") {
            if !mode.trim().is_empty() {
                self.mode = lookup_mode(&mode)?;
            }
        }
        if let Ok(format) = std::env::var("SYNCTRACE_PIXEL_FORMAT") {
            if !format.trim().is_empty() {
                self.pixel_format = PixelFormat::parse(&format)?;
            }
        }
        if let Ok(path) = std::env::var("SYNCTRACE_VIDEO_OUT") {
            if !path.trim().is_empty() {
                self.video_out = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("SYNCTRACE_LOG_OUT") {
            if !path.trim().is_empty() {
                self.log_out = Some(PathBuf::from(path));
            }
        }
        if let Ok(max_frames) = std::env::var("SYNCTRACE_MAX_FRAMES") {
            self.max_frames = max_frames
                .parse()
                .map_err(|_| anyhow!("SYNCTRACE_MAX_FRAMES must be an integer frame count"))?;
        }
        if let Ok(policy) = std::env::var("SYNCTRACE_LATE_POLICY") {
            if !policy.trim().is_empty() {
                self.late_policy = LateFramePolicy::parse(&policy)?;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(anyhow!("device must not be empty"));
        }
        if self.late_threshold_ticks <= 0 {
            return Err(anyhow!("late threshold must be greater than zero ticks"));
        }
        if let (Some(video), Some(log)) = (&self.video_out, &self.log_out) {
            if video == log {
                return Err(anyhow!("video output and log file must be different paths"));
            }
        }
        Ok(())
    }
}

fn lookup_mode(name: &str) -> Result<DisplayMode> {
    DisplayMode::by_name(name).ok_or_else(|| {
        anyhow!(
            "unknown display mode '{}' (known modes: {})",
            name,
            DisplayMode::known_names().join(", ")
        )
    })
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
