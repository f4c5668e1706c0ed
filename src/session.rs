//! Capture session orchestration.
//!
//! `CaptureSession` owns one capture run end to end: it wires a
//! `CaptureInput` to the frame pipeline, runs the stream/wait/stop loop on
//! the calling thread, and tears the run down in an order that cannot lose
//! queued frames.
//!
//! Three threads touch a session:
//! - The device delivery thread drives `frame_arrived`/`format_changed`.
//! - The disk writer drains the write queue (see `writer`).
//! - The main thread sleeps in `run()` on the shutdown condvar.
//!
//! The frame callback is the hot path. Its contract, in order:
//! 1. Take the wall-clock stamp before anything else.
//! 2. Sample the hardware clock and read the frame's reference stamp; a
//!    frame without a stamp is logged and skipped.
//! 3. Judge arrival timing; apply the late-frame policy.
//! 4. No-signal frames count toward the total and the frame cap, nothing
//!    else.
//! 5. Frames with at least one marker produce a log entry and, when a video
//!    file is configured, a retained push onto the write queue.
//! 6. Observers see every signal frame.
//! 7. The total advances; hitting the frame cap raises the exit signal.
//!
//! The callback never blocks on disk and never panics on device errors.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::device::{CaptureInput, InputCallback, InputFlags};
use crate::event_log::{EventLog, LogEntry};
use crate::frame::{DisplayMode, PixelFormat, VideoFrame};
use crate::markers::{MarkerDecoder, StripeDecoder};
use crate::now_micros;
use crate::timing::{LateFramePolicy, TimingValidator, TimingVerdict, DEFAULT_LATE_THRESHOLD_TICKS};
use crate::writer::{DiskWriter, DiskWriterHandle, WriteQueue, WriterStats, WRITER_POLL_INTERVAL};

// ----------------------------------------------------------------------------
// ShutdownSignal
// ----------------------------------------------------------------------------

/// Exit request shared between signal handlers, the frame callback, and the
/// main thread.
///
/// `raised()` is a lock-free read for the callback hot path; `wait()` parks
/// the main thread on a condvar instead of polling.
pub struct ShutdownSignal {
    raised: AtomicBool,
    state: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            state: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Request exit and wake anyone parked in `wait()`. Idempotent, and safe
    /// to call from a signal handler thread.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        let mut raised = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *raised = true;
        self.wake.notify_all();
    }

    pub fn raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Park until `raise()` has been called. Returns immediately if it
    /// already has.
    pub fn wait(&self) {
        let mut raised = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !*raised {
            raised = self.wake.wait(raised).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Observers
// ----------------------------------------------------------------------------

/// Receives every signal-bearing frame after marker processing.
///
/// Implementations run on the delivery thread and MUST NOT retain the pixel
/// slice beyond the call or block.
pub trait FrameObserver: Send {
    fn frame(&mut self, pixels: &[u8], width: u32, height: u32, row_bytes: u32);
}

/// Observer that reports sustained frame throughput.
pub struct ThroughputObserver {
    interval: Duration,
    window_start: Instant,
    frames: u64,
}

impl ThroughputObserver {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            frames: 0,
        }
    }

    /// Frames seen in the current reporting window.
    pub fn window_frames(&self) -> u64 {
        self.frames
    }
}

impl Default for ThroughputObserver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl FrameObserver for ThroughputObserver {
    fn frame(&mut self, _pixels: &[u8], _width: u32, _height: u32, _row_bytes: u32) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.interval {
            info!(
                "capture throughput: {:.1} frames/s",
                self.frames as f64 / elapsed.as_secs_f64()
            );
            self.frames = 0;
            self.window_start = Instant::now();
        }
    }
}

// ----------------------------------------------------------------------------
// Session state and stats
// ----------------------------------------------------------------------------

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Stopping,
    /// Streams halted and the write queue observed empty.
    Drained,
    /// Writer joined, output files closed. Terminal.
    Exited,
}

/// Counters for one session. `total_frames` counts every delivered frame
/// including no-signal slots; `valid_frames` counts only frames that
/// produced a log entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub total_frames: u64,
    pub valid_frames: u64,
    pub no_signal_frames: u64,
    /// Frames skipped because no timestamp could be obtained for them.
    pub dropped_frames: u64,
    pub late_frames: u64,
    pub queued_frames: u64,
    pub rejected_pushes: u64,
    pub log_write_errors: u64,
    pub writer: WriterStats,
}

/// Everything a session needs to be constructed.
pub struct SessionOptions {
    pub mode: DisplayMode,
    pub pixel_format: PixelFormat,
    pub format_detection: bool,
    /// Stop after this many frames. 0 means unbounded.
    pub max_frames: u64,
    pub late_policy: LateFramePolicy,
    pub late_threshold_ticks: i64,
    pub video_out: Option<PathBuf>,
    /// Log file path; `None` sends rows to the console.
    pub log_out: Option<PathBuf>,
    pub decoder: Box<dyn MarkerDecoder + Send>,
    pub observer: Option<Box<dyn FrameObserver>>,
}

impl SessionOptions {
    pub fn new(mode: DisplayMode) -> Self {
        Self {
            mode,
            pixel_format: PixelFormat::Yuv8Bit,
            format_detection: false,
            max_frames: 0,
            late_policy: LateFramePolicy::default(),
            late_threshold_ticks: DEFAULT_LATE_THRESHOLD_TICKS,
            video_out: None,
            log_out: None,
            decoder: Box::new(StripeDecoder::new()),
            observer: None,
        }
    }
}

// ----------------------------------------------------------------------------
// SessionCore: the InputCallback
// ----------------------------------------------------------------------------

struct Pipeline {
    validator: TimingValidator,
    decoder: Box<dyn MarkerDecoder + Send>,
    event_log: EventLog,
    observer: Option<Box<dyn FrameObserver>>,
    stats: SessionStats,
}

struct SessionCore {
    device: Arc<dyn CaptureInput>,
    queue: Arc<WriteQueue>,
    shutdown: Arc<ShutdownSignal>,
    input_flags: InputFlags,
    late_policy: LateFramePolicy,
    max_frames: u64,
    video_enabled: bool,
    /// Set once by the late-abort path; the callback short-circuits forever
    /// after.
    aborted: AtomicBool,
    pipeline: Mutex<Pipeline>,
}

impl SessionCore {
    fn lock_pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish_frame(&self, pipeline: &mut Pipeline) {
        pipeline.stats.total_frames += 1;
        if self.max_frames > 0 && pipeline.stats.total_frames >= self.max_frames {
            info!("frame cap reached ({} frames); raising exit", self.max_frames);
            self.shutdown.raise();
        }
    }
}

impl InputCallback for SessionCore {
    fn frame_arrived(&self, frame: Arc<VideoFrame>) {
        // Wall clock first. Everything below costs time that must not fold
        // into the arrival stamp.
        let wall_clock_us = now_micros();

        if self.aborted.load(Ordering::SeqCst) {
            return;
        }
        let mut pipeline = self.lock_pipeline();

        let clock = match self.device.hardware_clock() {
            Ok(clock) => clock,
            Err(err) => {
                error!("hardware clock query failed: {:#}", err);
                pipeline.stats.dropped_frames += 1;
                return;
            }
        };
        let Some(reference) = frame.reference else {
            error!("frame carries no reference timestamp; skipping");
            pipeline.stats.dropped_frames += 1;
            return;
        };

        match pipeline.validator.check(reference.timestamp) {
            TimingVerdict::Baseline => {
                debug!("timing baseline seeded at {}", reference.timestamp);
            }
            TimingVerdict::OnTime { .. } => {}
            TimingVerdict::Late { delta } => {
                pipeline.stats.late_frames += 1;
                let threshold = pipeline.validator.threshold_ticks();
                match self.late_policy {
                    LateFramePolicy::Abort => {
                        error!(
                            "frame arrived {} ticks after the previous frame (threshold {}); aborting",
                            delta, threshold
                        );
                        self.aborted.store(true, Ordering::SeqCst);
                        self.shutdown.raise();
                        return;
                    }
                    LateFramePolicy::Warn => {
                        warn!(
                            "frame arrived {} ticks after the previous frame (threshold {})",
                            delta, threshold
                        );
                    }
                }
            }
        }

        if frame.flags.no_input_source {
            debug!("frame {}: no input signal", pipeline.stats.total_frames);
            pipeline.stats.no_signal_frames += 1;
            self.finish_frame(&mut pipeline);
            return;
        }

        let markers =
            pipeline
                .decoder
                .decode(frame.bytes(), frame.width, frame.height, frame.row_bytes);
        if markers.any() {
            let entry = LogEntry {
                valid_frame_index: pipeline.stats.valid_frames,
                markers,
                wall_clock_us,
                hw_timestamp: clock.hardware_time,
                frame_ref_timestamp: reference.timestamp,
                frame_ref_duration: reference.duration,
            };
            if let Err(err) = pipeline.event_log.append(&entry) {
                error!("failed to append log entry: {:#}", err);
                pipeline.stats.log_write_errors += 1;
            }
            pipeline.stats.valid_frames += 1;

            if self.video_enabled {
                if self.queue.push(Arc::clone(&frame)) {
                    pipeline.stats.queued_frames += 1;
                } else {
                    warn!("write queue is closed; dropping frame payload");
                    pipeline.stats.rejected_pushes += 1;
                }
            }
        }

        if let Some(observer) = pipeline.observer.as_mut() {
            observer.frame(frame.bytes(), frame.width, frame.height, frame.row_bytes);
        }

        self.finish_frame(&mut pipeline);
    }

    fn format_changed(&self, mode: DisplayMode, rgb444: bool) {
        let pixel_format = if rgb444 {
            PixelFormat::Rgb10Bit
        } else {
            PixelFormat::Yuv10Bit
        };
        info!(
            "video format changed: {} ({}x{}), switching to {}",
            mode.name,
            mode.width,
            mode.height,
            pixel_format.name()
        );
        self.device.stop_streams();
        if let Err(err) = self
            .device
            .enable_input(&mode, pixel_format, self.input_flags)
        {
            // Capture halts until an operator intervenes, but the run is not
            // torn down over a transient mode change.
            error!("failed to re-enable video input after format change: {:#}", err);
            return;
        }
        if let Err(err) = self.device.start_streams() {
            error!("failed to restart streams after format change: {:#}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// CaptureSession
// ----------------------------------------------------------------------------

fn open_video_output(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o664);
    }
    options
        .open(path)
        .with_context(|| format!("failed to open video output {}", path.display()))
}

/// One capture run: device, pipeline, writer, and the main-thread loop.
pub struct CaptureSession {
    device: Arc<dyn CaptureInput>,
    core: Arc<SessionCore>,
    queue: Arc<WriteQueue>,
    shutdown: Arc<ShutdownSignal>,
    writer: Option<DiskWriterHandle>,
    mode: DisplayMode,
    pixel_format: PixelFormat,
    state: SessionState,
}

impl CaptureSession {
    /// Open output files, spawn the disk writer if a video path is
    /// configured, and install the frame callback on the device.
    ///
    /// Failures here are setup failures; nothing has started streaming yet.
    pub fn new(device: Arc<dyn CaptureInput>, options: SessionOptions) -> Result<Self> {
        let event_log = match &options.log_out {
            Some(path) => EventLog::file(path, options.video_out.as_deref())?,
            None => EventLog::console(),
        };

        let queue = Arc::new(WriteQueue::new());
        let shutdown = Arc::new(ShutdownSignal::new());

        let writer = match &options.video_out {
            Some(path) => {
                let out = open_video_output(path)?;
                // Payload size is fixed for the whole run at the geometry
                // negotiated here; the writer skips anything else.
                let frame_bytes = options.pixel_format.row_bytes(options.mode.width) as usize
                    * options.mode.height as usize;
                Some(DiskWriter::spawn(Arc::clone(&queue), out, frame_bytes))
            }
            None => None,
        };

        let core = Arc::new(SessionCore {
            device: Arc::clone(&device),
            queue: Arc::clone(&queue),
            shutdown: Arc::clone(&shutdown),
            input_flags: InputFlags {
                enable_format_detection: options.format_detection,
            },
            late_policy: options.late_policy,
            max_frames: options.max_frames,
            video_enabled: writer.is_some(),
            aborted: AtomicBool::new(false),
            pipeline: Mutex::new(Pipeline {
                validator: TimingValidator::new(options.late_threshold_ticks),
                decoder: options.decoder,
                event_log,
                observer: options.observer,
                stats: SessionStats::default(),
            }),
        });
        device.set_callback(Arc::clone(&core) as Arc<dyn InputCallback>);

        Ok(Self {
            device,
            core,
            queue,
            shutdown,
            writer,
            mode: options.mode,
            pixel_format: options.pixel_format,
            state: SessionState::Idle,
        })
    }

    /// Handle for wiring signal handlers and for tests.
    pub fn shutdown(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counter snapshot. Writer counters are live until `run` returns.
    pub fn stats(&self) -> SessionStats {
        let mut stats = self.core.lock_pipeline().stats;
        if let Some(writer) = &self.writer {
            stats.writer = writer.stats();
        }
        stats
    }

    /// Enable the configured mode and start streams.
    pub fn start(&mut self) -> Result<()> {
        if self.state == SessionState::Streaming {
            return Ok(());
        }
        // Each streaming segment seeds a fresh timing baseline.
        self.core.lock_pipeline().validator.reset();
        self.device
            .enable_input(&self.mode, self.pixel_format, self.core.input_flags)
            .context("failed to enable video input; is another application using the device?")?;
        self.device.start_streams().context("failed to start streams")?;
        self.state = SessionState::Streaming;
        info!(
            "capture streaming: {} ({}x{}, {})",
            self.mode.name,
            self.mode.width,
            self.mode.height,
            self.pixel_format.name()
        );
        Ok(())
    }

    /// Halt streams and wait for the writer to consume the backlog.
    ///
    /// The queue stays open and the video file stays open; a later `start`
    /// resumes appending to the same outputs.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Ok(());
        }
        self.state = SessionState::Stopping;
        info!("stopping capture");
        self.device.stop_streams();
        self.device.disable_input();
        while !self.queue.is_empty() {
            thread::sleep(WRITER_POLL_INTERVAL);
        }
        self.state = SessionState::Drained;
        Ok(())
    }

    /// Stream until the exit signal is raised, then tear down.
    ///
    /// Blocks the calling thread. Returns an error for setup failures and
    /// for runs ended by the late-frame abort policy.
    pub fn run(&mut self) -> Result<()> {
        let streamed = self.stream_until_exit();
        let finished = self.finish();
        streamed.and(finished)
    }

    fn stream_until_exit(&mut self) -> Result<()> {
        while !self.shutdown.raised() {
            self.start()?;
            self.shutdown.wait();
            self.stop()?;
        }
        Ok(())
    }

    /// Close the queue to producers, join the writer, and record final
    /// stats. After this the session is terminal.
    fn finish(&mut self) -> Result<()> {
        self.stop()?;
        self.queue.close();
        if let Some(writer) = self.writer.take() {
            let stats = writer.stop()?;
            self.core.lock_pipeline().stats.writer = stats;
        }
        self.state = SessionState::Exited;

        let stats = self.stats();
        info!(
            "capture finished: {} frames seen, {} valid, {} written to disk",
            stats.total_frames, stats.valid_frames, stats.writer.frames_written
        );
        if self.core.aborted.load(Ordering::SeqCst) {
            return Err(anyhow!(
                "capture aborted: a frame arrived later than the configured threshold"
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFlags, FrameReference};
    use crate::markers::{paint_stripe, MarkerPair, MarkerRegion};
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::AtomicU64;
    use tempfile::NamedTempFile;

    const WIDTH: u32 = 160;
    const HEIGHT: u32 = 32;
    const ROW_BYTES: u32 = 320;

    /// Test input whose frames are delivered by the test itself.
    struct ManualInput {
        callback: Mutex<Option<Arc<dyn InputCallback>>>,
        clock: AtomicI64,
        enabled: AtomicBool,
    }

    impl ManualInput {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                callback: Mutex::new(None),
                clock: AtomicI64::new(0),
                enabled: AtomicBool::new(false),
            })
        }

        fn deliver(&self, frame: VideoFrame) {
            let callback = self
                .callback
                .lock()
                .unwrap()
                .clone()
                .expect("callback installed");
            callback.frame_arrived(Arc::new(frame));
        }
    }

    impl CaptureInput for ManualInput {
        fn set_callback(&self, callback: Arc<dyn InputCallback>) {
            *self.callback.lock().unwrap() = Some(callback);
        }

        fn enable_input(
            &self,
            _mode: &DisplayMode,
            _pixel_format: PixelFormat,
            _flags: InputFlags,
        ) -> Result<()> {
            self.enabled.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn start_streams(&self) -> Result<()> {
            Ok(())
        }

        fn stop_streams(&self) {}

        fn disable_input(&self) {
            self.enabled.store(false, Ordering::SeqCst);
        }

        fn hardware_clock(&self) -> Result<crate::device::HardwareClock> {
            let t = self.clock.fetch_add(1_000, Ordering::SeqCst);
            Ok(crate::device::HardwareClock {
                hardware_time: t,
                time_in_frame: 0,
                ticks_per_frame: 16_667,
            })
        }

        fn supports_mode(&self, _mode: &DisplayMode, _pixel_format: PixelFormat) -> bool {
            true
        }

        fn supports_format_detection(&self) -> bool {
            false
        }
    }

    fn test_mode() -> DisplayMode {
        DisplayMode::new("bench160", WIDTH, HEIGHT, 16_000)
    }

    fn stamped_frame(timestamp: i64, markers: MarkerPair) -> VideoFrame {
        let mut data = vec![0x20u8; ROW_BYTES as usize * HEIGHT as usize];
        if let Some(value) = markers.upper {
            paint_stripe(&mut data, HEIGHT, ROW_BYTES, MarkerRegion::Upper, value).unwrap();
        }
        if let Some(value) = markers.lower {
            paint_stripe(&mut data, HEIGHT, ROW_BYTES, MarkerRegion::Lower, value).unwrap();
        }
        VideoFrame::new(
            data,
            WIDTH,
            HEIGHT,
            ROW_BYTES,
            FrameFlags::default(),
            Some(FrameReference {
                timestamp,
                duration: 16_000,
            }),
        )
        .unwrap()
    }

    fn no_signal_frame(timestamp: i64) -> VideoFrame {
        VideoFrame::new(
            vec![0u8; ROW_BYTES as usize * HEIGHT as usize],
            WIDTH,
            HEIGHT,
            ROW_BYTES,
            FrameFlags {
                no_input_source: true,
            },
            Some(FrameReference {
                timestamp,
                duration: 16_000,
            }),
        )
        .unwrap()
    }

    fn unstamped_frame() -> VideoFrame {
        VideoFrame::new(
            vec![0u8; ROW_BYTES as usize * HEIGHT as usize],
            WIDTH,
            HEIGHT,
            ROW_BYTES,
            FrameFlags::default(),
            None,
        )
        .unwrap()
    }

    fn session_with(
        input: &Arc<ManualInput>,
        configure: impl FnOnce(&mut SessionOptions),
    ) -> CaptureSession {
        let mut options = SessionOptions::new(test_mode());
        configure(&mut options);
        CaptureSession::new(Arc::clone(input) as Arc<dyn CaptureInput>, options)
            .expect("session setup")
    }

    #[test]
    fn shutdown_signal_wakes_waiter() {
        let signal = Arc::new(ShutdownSignal::new());
        assert!(!signal.raised());
        let waiter = Arc::clone(&signal);
        let join = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(5));
        signal.raise();
        join.join().expect("waiter thread");
        assert!(signal.raised());
        // Raising again stays idempotent and wait returns immediately.
        signal.raise();
        signal.wait();
    }

    #[test]
    fn marker_frames_are_logged_with_increasing_index() {
        let log = NamedTempFile::new().expect("temp log");
        let input = ManualInput::new();
        let session = session_with(&input, |options| {
            options.log_out = Some(log.path().to_path_buf());
        });

        input.deliver(stamped_frame(1_000, MarkerPair::absent()));
        input.deliver(stamped_frame(17_000, MarkerPair::new(Some(42), None)));
        input.deliver(stamped_frame(33_000, MarkerPair::absent()));
        input.deliver(stamped_frame(49_000, MarkerPair::new(Some(7), Some(99))));

        let stats = session.stats();
        assert_eq!(stats.total_frames, 4);
        assert_eq!(stats.valid_frames, 2);
        assert_eq!(stats.late_frames, 0);

        let text = std::fs::read_to_string(log.path()).expect("read log");
        let rows: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("0,42,,"));
        assert!(rows[1].starts_with("1,7,99,"));
    }

    #[test]
    fn late_frame_aborts_and_short_circuits() {
        let input = ManualInput::new();
        let mut session = session_with(&input, |options| {
            options.late_policy = LateFramePolicy::Abort;
        });
        let shutdown = session.shutdown();

        input.deliver(stamped_frame(1_000_000, MarkerPair::absent()));
        input.deliver(stamped_frame(1_016_000, MarkerPair::absent()));
        input.deliver(stamped_frame(1_050_000, MarkerPair::absent()));
        assert!(shutdown.raised());

        // Frames after the abort are ignored entirely.
        input.deliver(stamped_frame(1_066_000, MarkerPair::new(Some(1), None)));
        let stats = session.stats();
        assert_eq!(stats.total_frames, 2);
        assert_eq!(stats.late_frames, 1);
        assert_eq!(stats.valid_frames, 0);

        let err = session.run().expect_err("aborted run fails");
        assert!(err.to_string().contains("aborted"));
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[test]
    fn late_frame_warn_policy_keeps_capturing() {
        let input = ManualInput::new();
        let session = session_with(&input, |options| {
            options.late_policy = LateFramePolicy::Warn;
        });

        input.deliver(stamped_frame(1_000_000, MarkerPair::absent()));
        input.deliver(stamped_frame(1_050_000, MarkerPair::new(Some(3), None)));
        input.deliver(stamped_frame(1_066_000, MarkerPair::new(Some(4), None)));

        let stats = session.stats();
        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.late_frames, 1);
        assert_eq!(stats.valid_frames, 2);
    }

    #[test]
    fn no_signal_frames_count_toward_cap_but_not_log() {
        let input = ManualInput::new();
        let session = session_with(&input, |options| {
            options.max_frames = 3;
        });
        let shutdown = session.shutdown();

        input.deliver(stamped_frame(1_000, MarkerPair::new(Some(1), None)));
        input.deliver(no_signal_frame(17_000));
        assert!(!shutdown.raised());
        input.deliver(stamped_frame(33_000, MarkerPair::new(Some(2), None)));
        assert!(shutdown.raised());

        let stats = session.stats();
        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.no_signal_frames, 1);
        assert_eq!(stats.valid_frames, 2);
    }

    #[test]
    fn unstamped_frames_are_dropped_not_counted() {
        let input = ManualInput::new();
        let session = session_with(&input, |_| {});

        input.deliver(unstamped_frame());
        input.deliver(stamped_frame(1_000, MarkerPair::absent()));

        let stats = session.stats();
        assert_eq!(stats.dropped_frames, 1);
        assert_eq!(stats.total_frames, 1);
    }

    #[test]
    fn observer_sees_signal_frames_only() {
        struct CountingObserver(Arc<AtomicU64>);
        impl FrameObserver for CountingObserver {
            fn frame(&mut self, _pixels: &[u8], _width: u32, _height: u32, _row_bytes: u32) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let seen = Arc::new(AtomicU64::new(0));
        let input = ManualInput::new();
        let _session = session_with(&input, |options| {
            options.observer = Some(Box::new(CountingObserver(Arc::clone(&seen))));
        });

        input.deliver(stamped_frame(1_000, MarkerPair::new(Some(5), None)));
        input.deliver(stamped_frame(17_000, MarkerPair::absent()));
        input.deliver(no_signal_frame(33_000));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn frames_reach_disk_before_run_returns() {
        let video = NamedTempFile::new().expect("temp video");
        let log = NamedTempFile::new().expect("temp log");
        let input = ManualInput::new();
        let mut session = session_with(&input, |options| {
            options.video_out = Some(video.path().to_path_buf());
            options.log_out = Some(log.path().to_path_buf());
        });

        for i in 0..10i64 {
            input.deliver(stamped_frame(
                1_000 + i * 16_000,
                MarkerPair::new(Some(i as u64), Some(i as u64)),
            ));
        }
        session.shutdown().raise();
        session.run().expect("clean run");

        let stats = session.stats();
        assert_eq!(stats.valid_frames, 10);
        assert_eq!(stats.queued_frames, 10);
        assert_eq!(stats.writer.frames_written, 10);
        let frame_bytes = ROW_BYTES as usize * HEIGHT as usize;
        let written = std::fs::read(video.path()).expect("read video");
        assert_eq!(written.len(), 10 * frame_bytes);
    }

    #[test]
    fn frame_cap_raises_exit_and_run_is_clean() {
        let input = ManualInput::new();
        let mut session = session_with(&input, |options| {
            options.max_frames = 2;
        });
        let shutdown = session.shutdown();

        input.deliver(stamped_frame(1_000, MarkerPair::absent()));
        input.deliver(stamped_frame(17_000, MarkerPair::absent()));
        assert!(shutdown.raised());
        session.run().expect("cap-bounded run is a clean exit");
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[test]
    fn throughput_observer_rolls_its_window() {
        let mut observer = ThroughputObserver::new(Duration::from_secs(0));
        observer.frame(&[0u8; 4], 2, 1, 2);
        // Zero-length window reports and resets on every frame.
        assert_eq!(observer.window_frames(), 0);
    }
}
