//! Frame payload persistence.
//!
//! The capture callback must never block on disk, so frames headed for the
//! video file take a two-stage path:
//!
//! - `WriteQueue`: FIFO handoff. Producers push retained frames under a
//!   mutex held only for the push itself; the consumer pops the same way.
//! - `DiskWriter`: a dedicated thread that drains the queue to the output
//!   file, polling with a short sleep when the queue is empty.
//!
//! Drain contract: the writer exits only once the queue is closed to
//! producers AND empty, so every frame accepted before `close()` reaches the
//! file before the thread ends. Pushes after close are rejected and counted.
//!
//! Write failures are logged and counted, never fatal; losing the tail of
//! the raw video is preferable to killing a measurement run.

use anyhow::{anyhow, Result};
use log::{debug, error};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::frame::VideoFrame;

/// Sleep between polls of an empty queue.
pub const WRITER_POLL_INTERVAL: Duration = Duration::from_micros(100);

// ----------------------------------------------------------------------------
// WriteQueue
// ----------------------------------------------------------------------------

/// Outcome of one consumer poll.
pub enum QueuePoll {
    /// Next frame in FIFO order.
    Frame(Arc<VideoFrame>),
    /// Nothing queued right now; the queue is still open.
    Empty,
    /// Closed and fully consumed. The consumer can exit.
    Drained,
}

struct QueueState {
    frames: VecDeque<Arc<VideoFrame>>,
    closed: bool,
}

/// FIFO queue of retained frames between the capture callback and the
/// disk writer.
pub struct WriteQueue {
    state: Mutex<QueueState>,
    rejected: AtomicU64,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                closed: false,
            }),
            rejected: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push a retained frame. Returns false (and counts the rejection) once
    /// the queue has been closed.
    pub fn push(&self, frame: Arc<VideoFrame>) -> bool {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        state.frames.push_back(frame);
        true
    }

    /// Consumer side. A single locked check decides between a frame, an open
    /// but empty queue, and the drained terminal state; there is no window
    /// where a frame accepted before `close()` can be missed.
    pub fn poll(&self) -> QueuePoll {
        let mut state = self.lock();
        match state.frames.pop_front() {
            Some(frame) => QueuePoll::Frame(frame),
            None if state.closed => QueuePoll::Drained,
            None => QueuePoll::Empty,
        }
    }

    /// Stop accepting pushes. Frames already queued remain consumable.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Pushes refused because the queue was already closed.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// DiskWriter
// ----------------------------------------------------------------------------

#[derive(Default)]
struct WriterCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

/// Snapshot of writer progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub frames_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    pub size_skipped: u64,
}

/// Spawns and owns the disk writer thread.
pub struct DiskWriter;

impl DiskWriter {
    /// Start the writer thread.
    ///
    /// `frame_bytes` is the payload size negotiated at capture start; queued
    /// entries of any other size are counted and skipped, since appending
    /// them would corrupt the fixed-stride raw file.
    pub fn spawn(queue: Arc<WriteQueue>, out: File, frame_bytes: usize) -> DiskWriterHandle {
        let counters = Arc::new(WriterCounters::default());
        let thread_queue = Arc::clone(&queue);
        let thread_counters = Arc::clone(&counters);
        let join = thread::spawn(move || {
            run_writer(&thread_queue, out, frame_bytes, &thread_counters);
        });
        DiskWriterHandle {
            queue,
            counters,
            join: Some(join),
        }
    }
}

pub struct DiskWriterHandle {
    queue: Arc<WriteQueue>,
    counters: Arc<WriterCounters>,
    join: Option<JoinHandle<()>>,
}

impl DiskWriterHandle {
    /// Live progress snapshot.
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            frames_written: self.counters.frames.load(Ordering::SeqCst),
            bytes_written: self.counters.bytes.load(Ordering::SeqCst),
            write_errors: self.counters.errors.load(Ordering::SeqCst),
            size_skipped: self.counters.skipped.load(Ordering::SeqCst),
        }
    }

    /// Close the queue, wait for the remaining frames to hit the file, and
    /// return the final stats. The output file is closed when this returns.
    pub fn stop(mut self) -> Result<WriterStats> {
        self.queue.close();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("disk writer thread panicked"))?;
        }
        Ok(self.stats())
    }
}

impl Drop for DiskWriterHandle {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_writer(queue: &WriteQueue, mut out: File, frame_bytes: usize, counters: &WriterCounters) {
    loop {
        match queue.poll() {
            QueuePoll::Frame(frame) => {
                if frame.payload_len() != frame_bytes {
                    error!(
                        "queued frame payload is {} bytes, expected {}; skipping",
                        frame.payload_len(),
                        frame_bytes
                    );
                    counters.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                match out.write_all(frame.bytes()) {
                    Ok(()) => {
                        counters.frames.fetch_add(1, Ordering::SeqCst);
                        counters
                            .bytes
                            .fetch_add(frame.payload_len() as u64, Ordering::SeqCst);
                    }
                    Err(err) => {
                        error!("video write failed: {}", err);
                        counters.errors.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            QueuePoll::Empty => thread::sleep(WRITER_POLL_INTERVAL),
            QueuePoll::Drained => break,
        }
    }
    debug!(
        "disk writer drained: {} frames on disk",
        counters.frames.load(Ordering::SeqCst)
    );
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFlags;
    use std::fs;
    use tempfile::NamedTempFile;

    const ROW_BYTES: u32 = 16;
    const HEIGHT: u32 = 4;
    const FRAME_BYTES: usize = (ROW_BYTES * HEIGHT) as usize;

    fn make_frame(fill: u8) -> Arc<VideoFrame> {
        let data = vec![fill; FRAME_BYTES];
        Arc::new(
            VideoFrame::new(data, 8, HEIGHT, ROW_BYTES, FrameFlags::default(), None)
                .expect("frame geometry"),
        )
    }

    fn make_sized_frame(bytes: usize) -> Arc<VideoFrame> {
        let width = bytes as u32;
        Arc::new(
            VideoFrame::new(vec![0xAB; bytes], width, 1, width, FrameFlags::default(), None)
                .expect("frame geometry"),
        )
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let queue = WriteQueue::new();
        for fill in [1u8, 2, 3] {
            assert!(queue.push(make_frame(fill)));
        }
        queue.close();
        for expected in [1u8, 2, 3] {
            match queue.poll() {
                QueuePoll::Frame(frame) => assert_eq!(frame.bytes()[0], expected),
                _ => panic!("expected a queued frame"),
            }
        }
        assert!(matches!(queue.poll(), QueuePoll::Drained));
    }

    #[test]
    fn push_after_close_is_rejected_and_counted() {
        let queue = WriteQueue::new();
        assert!(queue.push(make_frame(9)));
        queue.close();
        assert!(!queue.push(make_frame(10)));
        assert_eq!(queue.rejected(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn open_empty_queue_polls_empty() {
        let queue = WriteQueue::new();
        assert!(matches!(queue.poll(), QueuePoll::Empty));
        assert!(!queue.is_closed());
    }

    #[test]
    fn writer_persists_frames_in_order() {
        let file = NamedTempFile::new().expect("temp video");
        let out = file.reopen().expect("reopen");
        let queue = Arc::new(WriteQueue::new());
        let handle = DiskWriter::spawn(Arc::clone(&queue), out, FRAME_BYTES);

        for fill in [0x11u8, 0x22, 0x33] {
            assert!(queue.push(make_frame(fill)));
        }
        let stats = handle.stop().expect("writer stop");
        assert_eq!(stats.frames_written, 3);
        assert_eq!(stats.bytes_written, 3 * FRAME_BYTES as u64);
        assert_eq!(stats.write_errors, 0);

        let written = fs::read(file.path()).expect("read video");
        assert_eq!(written.len(), 3 * FRAME_BYTES);
        assert!(written[..FRAME_BYTES].iter().all(|&b| b == 0x11));
        assert!(written[FRAME_BYTES..2 * FRAME_BYTES].iter().all(|&b| b == 0x22));
        assert!(written[2 * FRAME_BYTES..].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn size_divergent_payload_is_skipped() {
        let file = NamedTempFile::new().expect("temp video");
        let out = file.reopen().expect("reopen");
        let queue = Arc::new(WriteQueue::new());
        let handle = DiskWriter::spawn(Arc::clone(&queue), out, FRAME_BYTES);

        assert!(queue.push(make_frame(0x44)));
        assert!(queue.push(make_sized_frame(FRAME_BYTES / 2)));
        assert!(queue.push(make_frame(0x55)));
        let stats = handle.stop().expect("writer stop");
        assert_eq!(stats.frames_written, 2);
        assert_eq!(stats.size_skipped, 1);

        let written = fs::read(file.path()).expect("read video");
        assert_eq!(written.len(), 2 * FRAME_BYTES);
    }

    #[test]
    fn stop_with_nothing_queued_leaves_empty_file() {
        let file = NamedTempFile::new().expect("temp video");
        let out = file.reopen().expect("reopen");
        let queue = Arc::new(WriteQueue::new());
        let handle = DiskWriter::spawn(queue, out, FRAME_BYTES);
        let stats = handle.stop().expect("writer stop");
        assert_eq!(stats, WriterStats::default());
        assert_eq!(fs::read(file.path()).expect("read video").len(), 0);
    }
}
