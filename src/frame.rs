//! Video frame model.
//!
//! - `VideoFrame`: Immutable frame delivered by a capture input. Pixel bytes are
//!   private; consumers read them through `bytes()` and share the frame as
//!   `Arc<VideoFrame>`. There is no mutable access after construction.
//! - `PixelFormat`: The pixel packings the pipeline understands, with their
//!   row-stride arithmetic.
//! - `DisplayMode`: Frame geometry plus nominal cadence on the hardware clock.
//!
//! A frame that reaches the session callback either carries a hardware
//! reference timestamp or is dropped; nothing downstream re-reads the device.

use anyhow::{anyhow, Result};

use crate::timing::TICKS_PER_SECOND;

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

/// Pixel packings supported by capture inputs.
///
/// Row stride depends on the packing, not just the width; all payload size
/// checks in the pipeline go through `row_bytes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit 4:2:2 (UYVY), 2 bytes per pixel.
    Yuv8Bit,
    /// 10-bit 4:2:2 (v210), 48-pixel groups packed into 128 bytes.
    Yuv10Bit,
    /// 10-bit 4:4:4 RGB (r210), 4 bytes per pixel.
    Rgb10Bit,
}

impl PixelFormat {
    /// Bytes per row for a frame of the given width.
    pub fn row_bytes(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Yuv8Bit => width * 2,
            PixelFormat::Yuv10Bit => ((width + 47) / 48) * 128,
            PixelFormat::Rgb10Bit => width * 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuv8Bit => "yuv8",
            PixelFormat::Yuv10Bit => "yuv10",
            PixelFormat::Rgb10Bit => "rgb10",
        }
    }

    /// Parse a configuration token ("yuv8", "yuv10", "rgb10").
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "yuv8" => Ok(PixelFormat::Yuv8Bit),
            "yuv10" => Ok(PixelFormat::Yuv10Bit),
            "rgb10" => Ok(PixelFormat::Rgb10Bit),
            other => Err(anyhow!(
                "unknown pixel format '{}' (expected yuv8, yuv10, or rgb10)",
                other
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// DisplayMode
// ----------------------------------------------------------------------------

/// Known display modes: (name, width, height, frame duration in clock ticks).
const MODE_TABLE: &[(&str, u32, u32, i64)] = &[
    ("720p50", 1280, 720, 20_000),
    ("720p5994", 1280, 720, 16_683),
    ("720p60", 1280, 720, 16_667),
    ("1080p2398", 1920, 1080, 41_708),
    ("1080p24", 1920, 1080, 41_667),
    ("1080p25", 1920, 1080, 40_000),
    ("1080p2997", 1920, 1080, 33_367),
    ("1080p30", 1920, 1080, 33_333),
    ("1080p50", 1920, 1080, 20_000),
    ("1080p5994", 1920, 1080, 16_683),
    ("1080p60", 1920, 1080, 16_667),
];

/// Frame geometry and nominal cadence.
///
/// `frame_duration` is expressed in hardware clock ticks (see
/// [`TICKS_PER_SECOND`]), matching the reference timestamps stamped on frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_duration: i64,
}

impl DisplayMode {
    pub fn new(name: &str, width: u32, height: u32, frame_duration: i64) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            frame_duration,
        }
    }

    /// Look up a mode from the built-in table by its configuration name.
    pub fn by_name(name: &str) -> Option<Self> {
        MODE_TABLE
            .iter()
            .find(|(n, _, _, _)| *n == name)
            .map(|&(n, w, h, d)| DisplayMode::new(n, w, h, d))
    }

    /// Names accepted by `by_name`, for diagnostics.
    pub fn known_names() -> Vec<&'static str> {
        MODE_TABLE.iter().map(|(n, _, _, _)| *n).collect()
    }

    /// Nominal frame rate derived from the cadence.
    pub fn fps(&self) -> f64 {
        if self.frame_duration <= 0 {
            return 0.0;
        }
        TICKS_PER_SECOND as f64 / self.frame_duration as f64
    }
}

// ----------------------------------------------------------------------------
// VideoFrame
// ----------------------------------------------------------------------------

/// Hardware reference timestamp stamped on a frame at capture.
///
/// `timestamp` and `duration` share the clock domain of
/// [`TICKS_PER_SECOND`]; `duration` is the frame interval the device reported
/// alongside the stamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameReference {
    pub timestamp: i64,
    pub duration: i64,
}

/// Per-frame condition flags reported by the capture input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// The device produced a frame slot but no signal was present on the
    /// input. Pixel content is undefined and must not be decoded or written.
    pub no_input_source: bool,
}

/// Immutable captured frame.
///
/// Pixel data is private: the only access is the shared `bytes()` slice, so a
/// frame queued for disk cannot be altered while it waits. Frames are shared
/// between the capture callback and the writer as `Arc<VideoFrame>`; the
/// payload lives until the last holder drops its handle.
pub struct VideoFrame {
    /// Private pixel data. No mutable or owning accessor exists.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,
    pub row_bytes: u32,

    pub flags: FrameFlags,

    /// Hardware reference stamp, if the device could provide one.
    pub reference: Option<FrameReference>,
}

impl VideoFrame {
    /// Build a frame from a captured payload.
    ///
    /// The payload length must match `row_bytes * height` exactly; a capture
    /// input that hands over a short or oversized buffer is a bug upstream,
    /// not something the pipeline can repair.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        row_bytes: u32,
        flags: FrameFlags,
        reference: Option<FrameReference>,
    ) -> Result<Self> {
        let expected = row_bytes as usize * height as usize;
        if data.len() != expected {
            return Err(anyhow!(
                "frame payload is {} bytes, expected {} ({} rows of {} bytes)",
                data.len(),
                expected,
                height,
                row_bytes
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            row_bytes,
            flags,
            reference,
        })
    }

    /// Read-only view of the pixel payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.data.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
