//! Capture input devices.
//!
//! This module provides the seam between the capture session and whatever
//! hardware (or stand-in) produces frames:
//!
//! - `CaptureInput`: control surface of an input device. Enable a mode,
//!   start/stop streams, sample the hardware reference clock.
//! - `InputCallback`: what a device calls as frames arrive or the signal
//!   format changes. Devices call it from their own delivery thread.
//! - `SyntheticInput`: built-in device for `synthetic://` URIs. Generates
//!   frames at the enabled mode's cadence, or replays a scripted event list;
//!   used for bench runs and tests.
//!
//! A device is responsible for delivering complete frames with reference
//! timestamps. It MUST NOT:
//! - Decode markers or judge frame timing (session concerns)
//! - Write anything to disk
//! - Block frame delivery on consumers

use anyhow::{anyhow, Result};
use log::{debug, error, info};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::frame::{DisplayMode, FrameFlags, FrameReference, PixelFormat, VideoFrame};
use crate::markers::{paint_stripe, MarkerPair, MarkerRegion};

/// URI scheme served by `SyntheticInput`.
pub const SYNTHETIC_SCHEME: &str = "synthetic://";

// ----------------------------------------------------------------------------
// Device seam
// ----------------------------------------------------------------------------

/// One reading of the device's reference clock.
///
/// All three fields share the tick domain of the frame reference timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareClock {
    pub hardware_time: i64,
    pub time_in_frame: i64,
    pub ticks_per_frame: i64,
}

/// Input options applied when a mode is enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputFlags {
    /// Let the device report signal format changes via
    /// `InputCallback::format_changed`.
    pub enable_format_detection: bool,
}

/// Delivered by a device from its delivery thread.
///
/// Implementations must return promptly; a slow callback stalls the device.
pub trait InputCallback: Send + Sync {
    fn frame_arrived(&self, frame: Arc<VideoFrame>);

    /// The input signal changed. `rgb444` reports whether the detected
    /// format is an RGB packing.
    fn format_changed(&self, mode: DisplayMode, rgb444: bool);
}

/// Control surface of a capture input.
///
/// Methods take `&self`; implementations synchronize internally, the way a
/// capture SDK does. `stop_streams` must tolerate being called from the
/// delivery thread itself (the format-change path does exactly that).
pub trait CaptureInput: Send + Sync {
    fn set_callback(&self, callback: Arc<dyn InputCallback>);

    fn enable_input(
        &self,
        mode: &DisplayMode,
        pixel_format: PixelFormat,
        flags: InputFlags,
    ) -> Result<()>;

    fn start_streams(&self) -> Result<()>;

    fn stop_streams(&self);

    fn disable_input(&self);

    /// Sample the reference clock. Fails when no input is enabled.
    fn hardware_clock(&self) -> Result<HardwareClock>;

    fn supports_mode(&self, mode: &DisplayMode, pixel_format: PixelFormat) -> bool;

    fn supports_format_detection(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Synthetic input
// ----------------------------------------------------------------------------

/// Tuning for the synthetic input.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Device URI (e.g. "synthetic://bench").
    pub device: String,
    /// Paint markers on every Nth frame. 1 marks every frame, 0 never.
    pub marker_period: u64,
    /// Uniform jitter applied to each reference timestamp step, in ticks.
    pub jitter_ticks: i64,
    /// Report a no-signal frame every Nth frame. 0 never.
    pub dropout_period: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device: format!("{}capture", SYNTHETIC_SCHEME),
            marker_period: 1,
            jitter_ticks: 0,
            dropout_period: 0,
        }
    }
}

/// One frame a scripted feed will synthesize.
#[derive(Clone, Debug)]
pub struct ScriptedFrame {
    /// Reference stamp, or `None` to simulate a device that failed to stamp
    /// the frame.
    pub reference: Option<FrameReference>,
    /// Markers painted into the payload. Ignored for no-signal frames.
    pub markers: MarkerPair,
    pub no_signal: bool,
    /// Background byte. Keep below 0x80 so unpainted regions never read as
    /// marker anchors.
    pub fill: u8,
}

impl ScriptedFrame {
    /// A clean stamped frame with no markers.
    pub fn stamped(timestamp: i64, duration: i64) -> Self {
        Self {
            reference: Some(FrameReference {
                timestamp,
                duration,
            }),
            markers: MarkerPair::absent(),
            no_signal: false,
            fill: 0x20,
        }
    }

    /// A frame the device could not stamp.
    pub fn unstamped() -> Self {
        Self {
            reference: None,
            markers: MarkerPair::absent(),
            no_signal: false,
            fill: 0x20,
        }
    }
}

/// One scripted delivery event.
#[derive(Clone, Debug)]
pub enum ScriptEvent {
    Frame(ScriptedFrame),
    FormatChange { mode: DisplayMode, rgb444: bool },
}

/// Statistics for a synthetic input.
#[derive(Clone, Debug)]
pub struct SyntheticStats {
    pub frames_delivered: u64,
    pub device: String,
}

#[derive(Clone)]
struct EnabledInput {
    mode: DisplayMode,
    pixel_format: PixelFormat,
    flags: InputFlags,
}

struct DeviceShared {
    epoch: Instant,
    enabled: Mutex<Option<EnabledInput>>,
    delivered: AtomicU64,
}

enum FrameFeed {
    /// Free-running generator at the enabled mode's cadence.
    Cadence,
    /// Scripted events. Shared so delivery resumes across stream restarts.
    Script(Arc<Mutex<VecDeque<ScriptEvent>>>),
}

struct StreamState {
    streaming: bool,
    run_flag: Option<Arc<AtomicBool>>,
    deliver: Option<JoinHandle<()>>,
}

/// Built-in capture input for `synthetic://` URIs.
pub struct SyntheticInput {
    config: SyntheticConfig,
    shared: Arc<DeviceShared>,
    feed: FrameFeed,
    callback: Mutex<Option<Arc<dyn InputCallback>>>,
    stream: Mutex<StreamState>,
}

impl SyntheticInput {
    /// Free-running input generating frames at the enabled cadence.
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        Self::with_feed(config, FrameFeed::Cadence)
    }

    /// Input that replays the given events, then goes quiet.
    pub fn scripted(config: SyntheticConfig, events: Vec<ScriptEvent>) -> Result<Self> {
        let script = Arc::new(Mutex::new(events.into_iter().collect()));
        Self::with_feed(config, FrameFeed::Script(script))
    }

    fn with_feed(config: SyntheticConfig, feed: FrameFeed) -> Result<Self> {
        if !config.device.starts_with(SYNTHETIC_SCHEME) {
            return Err(anyhow!(
                "synthetic input requires a {}* device URI, got '{}'",
                SYNTHETIC_SCHEME,
                config.device
            ));
        }
        Ok(Self {
            config,
            shared: Arc::new(DeviceShared {
                epoch: Instant::now(),
                enabled: Mutex::new(None),
                delivered: AtomicU64::new(0),
            }),
            feed,
            callback: Mutex::new(None),
            stream: Mutex::new(StreamState {
                streaming: false,
                run_flag: None,
                deliver: None,
            }),
        })
    }

    fn stream_lock(&self) -> MutexGuard<'_, StreamState> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> SyntheticStats {
        SyntheticStats {
            frames_delivered: self.shared.delivered.load(Ordering::SeqCst),
            device: self.config.device.clone(),
        }
    }

    /// Mode currently enabled, if any.
    pub fn enabled_mode(&self) -> Option<DisplayMode> {
        lock_enabled(&self.shared).as_ref().map(|e| e.mode.clone())
    }

    /// Pixel format currently enabled, if any.
    pub fn enabled_pixel_format(&self) -> Option<PixelFormat> {
        lock_enabled(&self.shared).as_ref().map(|e| e.pixel_format)
    }
}

fn lock_enabled(shared: &DeviceShared) -> MutexGuard<'_, Option<EnabledInput>> {
    shared.enabled.lock().unwrap_or_else(|e| e.into_inner())
}

impl CaptureInput for SyntheticInput {
    fn set_callback(&self, callback: Arc<dyn InputCallback>) {
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    fn enable_input(
        &self,
        mode: &DisplayMode,
        pixel_format: PixelFormat,
        flags: InputFlags,
    ) -> Result<()> {
        if self.stream_lock().streaming {
            return Err(anyhow!("video input is busy; stop streams first"));
        }
        if !self.supports_mode(mode, pixel_format) {
            return Err(anyhow!(
                "display mode '{}' ({}x{}) is not supported",
                mode.name,
                mode.width,
                mode.height
            ));
        }
        *lock_enabled(&self.shared) = Some(EnabledInput {
            mode: mode.clone(),
            pixel_format,
            flags,
        });
        info!(
            "SyntheticInput: enabled {} at {} ({})",
            self.config.device,
            mode.name,
            pixel_format.name()
        );
        Ok(())
    }

    fn start_streams(&self) -> Result<()> {
        let mut stream = self.stream_lock();
        if stream.streaming {
            return Err(anyhow!("streams already running"));
        }
        if lock_enabled(&self.shared).is_none() {
            return Err(anyhow!("video input not enabled"));
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("no input callback installed"))?;

        let run_flag = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&run_flag);
        let join = match &self.feed {
            FrameFeed::Cadence => {
                let config = self.config.clone();
                thread::spawn(move || run_cadence(&flag, &shared, &config, callback))
            }
            FrameFeed::Script(script) => {
                let script = Arc::clone(script);
                thread::spawn(move || run_script(&flag, &shared, &script, callback))
            }
        };
        stream.streaming = true;
        stream.run_flag = Some(run_flag);
        stream.deliver = Some(join);
        debug!("SyntheticInput: streams started on {}", self.config.device);
        Ok(())
    }

    fn stop_streams(&self) {
        let (run_flag, deliver) = {
            let mut stream = self.stream_lock();
            stream.streaming = false;
            (stream.run_flag.take(), stream.deliver.take())
        };
        if let Some(flag) = run_flag {
            flag.store(false, Ordering::SeqCst);
        }
        if let Some(join) = deliver {
            // The format-change path stops streams from the delivery thread
            // itself; joining there would deadlock. The cleared flag ends the
            // loop once the callback returns.
            if join.thread().id() == thread::current().id() {
                return;
            }
            let _ = join.join();
        }
    }

    fn disable_input(&self) {
        *lock_enabled(&self.shared) = None;
        debug!("SyntheticInput: input disabled on {}", self.config.device);
    }

    fn hardware_clock(&self) -> Result<HardwareClock> {
        let ticks_per_frame = lock_enabled(&self.shared)
            .as_ref()
            .map(|e| e.mode.frame_duration)
            .ok_or_else(|| anyhow!("video input not enabled"))?;
        let hardware_time = self.shared.epoch.elapsed().as_micros() as i64;
        Ok(HardwareClock {
            hardware_time,
            time_in_frame: hardware_time % ticks_per_frame.max(1),
            ticks_per_frame,
        })
    }

    fn supports_mode(&self, mode: &DisplayMode, _pixel_format: PixelFormat) -> bool {
        mode.width > 0 && mode.height > 0 && mode.frame_duration > 0
    }

    fn supports_format_detection(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Delivery threads
// ----------------------------------------------------------------------------

fn build_frame(
    enabled: &EnabledInput,
    markers: MarkerPair,
    fill: u8,
    no_signal: bool,
    reference: Option<FrameReference>,
) -> Result<VideoFrame> {
    let row_bytes = enabled.pixel_format.row_bytes(enabled.mode.width);
    let mut data = vec![fill; row_bytes as usize * enabled.mode.height as usize];
    if !no_signal {
        if let Some(value) = markers.upper {
            paint_stripe(&mut data, enabled.mode.height, row_bytes, MarkerRegion::Upper, value)?;
        }
        if let Some(value) = markers.lower {
            paint_stripe(&mut data, enabled.mode.height, row_bytes, MarkerRegion::Lower, value)?;
        }
    }
    VideoFrame::new(
        data,
        enabled.mode.width,
        enabled.mode.height,
        row_bytes,
        FrameFlags {
            no_input_source: no_signal,
        },
        reference,
    )
}

fn run_cadence(
    flag: &AtomicBool,
    shared: &DeviceShared,
    config: &SyntheticConfig,
    callback: Arc<dyn InputCallback>,
) {
    let mut rng = rand::thread_rng();
    let mut seq: u64 = 0;
    let mut next_ref: Option<i64> = None;

    while flag.load(Ordering::SeqCst) {
        let Some(enabled) = lock_enabled(shared).clone() else {
            break;
        };
        let duration = enabled.mode.frame_duration;
        thread::sleep(Duration::from_micros(duration.max(1) as u64));
        if !flag.load(Ordering::SeqCst) {
            break;
        }

        let jitter = if config.jitter_ticks > 0 {
            rng.gen_range(-config.jitter_ticks..=config.jitter_ticks)
        } else {
            0
        };
        let timestamp = match next_ref {
            Some(prev) => prev + (duration + jitter).max(1),
            None => shared.epoch.elapsed().as_micros() as i64,
        };
        next_ref = Some(timestamp);

        let no_signal = config.dropout_period > 0 && (seq + 1) % config.dropout_period == 0;
        let markers =
            if !no_signal && config.marker_period > 0 && seq % config.marker_period == 0 {
                // Both corners carry the generator sequence number.
                MarkerPair::new(Some(seq), Some(seq))
            } else {
                MarkerPair::absent()
            };
        let fill = 0x10 + (seq % 0x60) as u8;

        match build_frame(
            &enabled,
            markers,
            fill,
            no_signal,
            Some(FrameReference {
                timestamp,
                duration,
            }),
        ) {
            Ok(frame) => {
                shared.delivered.fetch_add(1, Ordering::SeqCst);
                callback.frame_arrived(Arc::new(frame));
            }
            Err(err) => error!("SyntheticInput: failed to build frame: {:#}", err),
        }
        seq += 1;
    }
}

fn run_script(
    flag: &AtomicBool,
    shared: &DeviceShared,
    script: &Mutex<VecDeque<ScriptEvent>>,
    callback: Arc<dyn InputCallback>,
) {
    while flag.load(Ordering::SeqCst) {
        let event = script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let Some(event) = event else {
            // Script exhausted; stay silent until streams are stopped.
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        match event {
            ScriptEvent::FormatChange { mode, rgb444 } => {
                let detection_enabled = lock_enabled(shared)
                    .as_ref()
                    .map(|e| e.flags.enable_format_detection)
                    .unwrap_or(false);
                if !detection_enabled {
                    debug!("SyntheticInput: format change scripted but detection is disabled");
                    continue;
                }
                info!("SyntheticInput: signaling format change to {}", mode.name);
                callback.format_changed(mode, rgb444);
                // The handler normally stops these streams and starts a new
                // delivery thread, which resumes the shared script.
            }
            ScriptEvent::Frame(scripted) => {
                let Some(enabled) = lock_enabled(shared).clone() else {
                    break;
                };
                match build_frame(
                    &enabled,
                    scripted.markers,
                    scripted.fill,
                    scripted.no_signal,
                    scripted.reference,
                ) {
                    Ok(frame) => {
                        shared.delivered.fetch_add(1, Ordering::SeqCst);
                        callback.frame_arrived(Arc::new(frame));
                    }
                    Err(err) => error!("SyntheticInput: failed to build frame: {:#}", err),
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
