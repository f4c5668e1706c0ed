//! Capture event log.
//!
//! Every frame that shows at least one sync marker produces one CSV row. The
//! log is the primary measurement output; the raw video file exists to
//! cross-check it offline.
//!
//! Sink selection is exclusive: rows go to a log file or to the console,
//! never both. A file log starts with `#`-prefixed header lines naming the
//! video target, the generation time, and the column order, so a bare file
//! is self-describing. `trace_check` consumes this format.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::markers::MarkerPair;

/// Column order of data rows, also written as the last header line.
pub const LOG_COLUMNS: &str =
    "valid_frame_index,marker_upper,marker_lower,wall_clock_us,hw_timestamp,frame_ref_timestamp,frame_ref_duration";

// ----------------------------------------------------------------------------
// LogEntry
// ----------------------------------------------------------------------------

/// One marker observation.
///
/// `valid_frame_index` counts only frames that produced an entry; it is not
/// the device frame count. `wall_clock_us` is epoch microseconds taken at the
/// top of the frame callback, before any clock queries or decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub valid_frame_index: u64,
    pub markers: MarkerPair,
    pub wall_clock_us: i64,
    pub hw_timestamp: i64,
    pub frame_ref_timestamp: i64,
    pub frame_ref_duration: i64,
}

fn field(value: Option<u64>) -> String {
    match value {
        Some(v) => v.to_string(),
        // Absent markers render as empty fields, not as a reserved number.
        None => String::new(),
    }
}

impl LogEntry {
    /// Render the entry as one CSV row (no trailing newline).
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.valid_frame_index,
            field(self.markers.upper),
            field(self.markers.lower),
            self.wall_clock_us,
            self.hw_timestamp,
            self.frame_ref_timestamp,
            self.frame_ref_duration
        )
    }
}

// ----------------------------------------------------------------------------
// EventLog
// ----------------------------------------------------------------------------

enum LogSink {
    File(BufWriter<File>),
    Console,
}

/// Append-only event log with a single sink.
pub struct EventLog {
    sink: LogSink,
    entries: u64,
}

impl EventLog {
    /// Open a file sink, truncating any previous log, and write the header.
    ///
    /// `video_target` names the raw video file this log describes, if one is
    /// being written.
    pub fn file(path: &Path, video_target: Option<&Path>) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        let mut sink = BufWriter::new(file);
        let target = match video_target {
            Some(p) => p.display().to_string(),
            None => "(none)".to_string(),
        };
        writeln!(sink, "# synctrace capture log")?;
        writeln!(sink, "# video output: {}", target)?;
        writeln!(sink, "# generated: {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"))?;
        writeln!(sink, "# {}", LOG_COLUMNS)?;
        sink.flush()
            .with_context(|| format!("failed to write log header to {}", path.display()))?;
        Ok(Self {
            sink: LogSink::File(sink),
            entries: 0,
        })
    }

    /// Console sink: rows go to stdout, no header.
    pub fn console() -> Self {
        Self {
            sink: LogSink::Console,
            entries: 0,
        }
    }

    /// Append one row. The row is flushed immediately so a crash mid-run
    /// loses at most the row being written.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        match &mut self.sink {
            LogSink::File(sink) => {
                writeln!(sink, "{}", entry.to_csv()).context("failed to append log entry")?;
                sink.flush().context("failed to flush log entry")?;
            }
            LogSink::Console => {
                let stdout = io::stdout();
                writeln!(stdout.lock(), "{}", entry.to_csv())
                    .context("failed to write log entry to stdout")?;
            }
        }
        self.entries += 1;
        Ok(())
    }

    /// Rows appended so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn sample_entry(index: u64, upper: Option<u64>, lower: Option<u64>) -> LogEntry {
        LogEntry {
            valid_frame_index: index,
            markers: MarkerPair::new(upper, lower),
            wall_clock_us: 1_700_000_000_000_000 + index as i64,
            hw_timestamp: 2_000 + index as i64,
            frame_ref_timestamp: 1_000 + 16_000 * index as i64,
            frame_ref_duration: 16_667,
        }
    }

    #[test]
    fn csv_row_renders_absent_markers_as_empty_fields() {
        let row = sample_entry(3, Some(42), None).to_csv();
        assert_eq!(
            row,
            "3,42,,1700000000000003,2003,49000,16667"
        );
        let row = sample_entry(0, None, Some(u64::MAX)).to_csv();
        assert!(row.starts_with("0,,18446744073709551615,"));
    }

    #[test]
    fn file_sink_writes_header_then_rows() {
        let file = NamedTempFile::new().expect("temp log");
        let video = PathBuf::from("capture.raw");
        let mut log = EventLog::file(file.path(), Some(&video)).expect("open log");
        log.append(&sample_entry(0, Some(1), Some(2))).expect("append");
        log.append(&sample_entry(1, None, Some(9))).expect("append");
        assert_eq!(log.entries(), 2);
        drop(log);

        let text = fs::read_to_string(file.path()).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "# synctrace capture log");
        assert_eq!(lines[1], "# video output: capture.raw");
        assert!(lines[2].starts_with("# generated: "));
        assert_eq!(lines[3], format!("# {}", LOG_COLUMNS));
        assert!(lines[4].starts_with("0,1,2,"));
        assert!(lines[5].starts_with("1,,9,"));
    }

    #[test]
    fn header_names_missing_video_target() {
        let file = NamedTempFile::new().expect("temp log");
        let log = EventLog::file(file.path(), None).expect("open log");
        drop(log);
        let text = fs::read_to_string(file.path()).expect("read log");
        assert!(text.contains("# video output: (none)"));
    }

    #[test]
    fn console_sink_counts_entries() {
        let mut log = EventLog::console();
        log.append(&sample_entry(0, Some(5), None)).expect("append");
        assert_eq!(log.entries(), 1);
    }
}
