//! synctrace
//!
//! Capture timing tracer: records when video frames actually arrive.
//!
//! A capture device delivers frames on its own thread; this crate stamps
//! each arrival, decodes the sync markers burned into the picture, checks
//! frame cadence against the device's reference clock, and persists a CSV
//! event log plus (optionally) the raw frame payloads.
//!
//! # Architecture
//!
//! The pipeline holds a few rules by construction:
//!
//! 1. **Stamp first**: the wall-clock timestamp is taken at the top of the
//!    frame callback, before clock queries, decoding, or locking.
//! 2. **Never block the callback**: disk writes happen on a dedicated writer
//!    thread behind a FIFO queue; the callback only pushes.
//! 3. **Retained frames are immutable**: pixel bytes are private and shared
//!    as `Arc<VideoFrame>`; a queued frame cannot change while it waits.
//! 4. **Absence is typed**: a marker that did not decode is `None`, never a
//!    reserved sentinel value.
//! 5. **Drain before close**: the writer exits only once its queue is both
//!    closed and empty, so an exit cannot strand accepted frames.
//!
//! # Module Structure
//!
//! - `frame`: frame model (VideoFrame, PixelFormat, DisplayMode)
//! - `device`: capture input seam and synthetic device (CaptureInput, SyntheticInput)
//! - `timing`: reference-clock cadence checks (TimingValidator)
//! - `markers`: sync marker decoding (MarkerDecoder, StripeDecoder)
//! - `event_log`: CSV measurement log (EventLog)
//! - `writer`: write queue and disk writer thread (WriteQueue, DiskWriter)
//! - `session`: orchestration (CaptureSession, ShutdownSignal)
//! - `config`: file + env configuration (CaptureConfig)

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod device;
pub mod event_log;
pub mod frame;
pub mod markers;
pub mod session;
pub mod timing;
pub mod writer;

pub use config::{CaptureConfig, SyntheticSettings};
pub use device::{
    CaptureInput, HardwareClock, InputCallback, InputFlags, ScriptEvent, ScriptedFrame,
    SyntheticConfig, SyntheticInput, SyntheticStats, SYNTHETIC_SCHEME,
};
pub use event_log::{EventLog, LogEntry, LOG_COLUMNS};
pub use frame::{DisplayMode, FrameFlags, FrameReference, PixelFormat, VideoFrame};
pub use markers::{paint_stripe, MarkerDecoder, MarkerPair, MarkerRegion, StripeDecoder};
pub use session::{
    CaptureSession, FrameObserver, SessionOptions, SessionState, SessionStats, ShutdownSignal,
    ThroughputObserver,
};
pub use timing::{
    LateFramePolicy, TimingValidator, TimingVerdict, DEFAULT_LATE_THRESHOLD_TICKS,
    TICKS_PER_SECOND,
};
pub use writer::{DiskWriter, DiskWriterHandle, QueuePoll, WriteQueue, WriterStats};

/// Epoch microseconds from the system clock. Pre-epoch clocks read as zero.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
}
