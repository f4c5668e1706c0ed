//! trace_check - offline verifier for capture timing logs
//!
//! This tool proves, from the CSV log alone:
//! - Valid frame indices are contiguous from zero (no dropped log rows)
//! - Every logged frame carried at least one decoded marker
//! - Reference timestamps advance strictly
//! - Arrival gaps beyond the late threshold are counted and reported
//!
//! The capture daemon already enforces these live; re-checking after the
//! fact catches truncated files and rows lost to write errors.

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use synctrace::DEFAULT_LATE_THRESHOLD_TICKS;

#[derive(Parser, Debug)]
#[command(
    name = "trace_check",
    about = "Verify a capture timing log (indices, markers, reference cadence)"
)]
struct Args {
    /// Path to the capture CSV log
    #[arg(long, default_value = "capture.csv")]
    log: String,

    /// Late-arrival threshold in reference clock ticks
    #[arg(long, default_value_t = DEFAULT_LATE_THRESHOLD_TICKS)]
    threshold: i64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogRow {
    valid_frame_index: u64,
    marker_upper: Option<u64>,
    marker_lower: Option<u64>,
    wall_clock_us: i64,
    hw_timestamp: i64,
    frame_ref_timestamp: i64,
    frame_ref_duration: i64,
}

#[derive(Debug, Default)]
struct CheckReport {
    rows: usize,
    late_rows: u64,
    /// Largest arrival gap between consecutive rows, in ticks.
    max_gap: i64,
    /// Distinct frame durations, in first-seen order.
    durations: Vec<i64>,
    violations: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let text = std::fs::read_to_string(&args.log)
        .with_context(|| format!("failed to read log file {}", args.log))?;
    let rows = parse_log(&text)?;

    println!("trace_check: checking {}", args.log);
    println!();

    let report = check_rows(&rows, args.threshold, |i, row| {
        if args.verbose {
            println!(
                "  row {}: markers=({},{}) hw={} ref={} dur={}",
                i,
                marker_text(row.marker_upper),
                marker_text(row.marker_lower),
                row.hw_timestamp,
                row.frame_ref_timestamp,
                row.frame_ref_duration
            );
        }
    });

    println!("checked {} log rows", report.rows);
    if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
        println!(
            "reference span: {} .. {} ticks",
            first.frame_ref_timestamp, last.frame_ref_timestamp
        );
    }
    if !report.durations.is_empty() {
        let durations: Vec<String> = report.durations.iter().map(|d| d.to_string()).collect();
        println!("frame durations seen: {}", durations.join(", "));
    }
    if report.rows > 1 {
        println!("largest arrival gap: {} ticks", report.max_gap);
    }
    println!(
        "late arrivals (gap > {} ticks): {}",
        args.threshold, report.late_rows
    );

    if !report.violations.is_empty() {
        println!();
        for violation in &report.violations {
            println!("VIOLATION: {}", violation);
        }
        return Err(anyhow!(
            "{} violations in {}",
            report.violations.len(),
            args.log
        ));
    }

    println!("OK: log is consistent.");
    Ok(())
}

fn marker_text(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |m| m.to_string())
}

/// Parses the log body, skipping `#` header lines and blank lines.
fn parse_log(text: &str) -> Result<Vec<LogRow>> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = parse_row(line).with_context(|| format!("log line {}", lineno + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

fn parse_row(line: &str) -> Result<LogRow> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 7 {
        return Err(anyhow!("expected 7 fields, found {}", fields.len()));
    }
    Ok(LogRow {
        valid_frame_index: parse_field(fields[0], "valid frame index")?,
        marker_upper: parse_marker(fields[1], "upper marker")?,
        marker_lower: parse_marker(fields[2], "lower marker")?,
        wall_clock_us: parse_field(fields[3], "wall clock")?,
        hw_timestamp: parse_field(fields[4], "hardware timestamp")?,
        frame_ref_timestamp: parse_field(fields[5], "reference timestamp")?,
        frame_ref_duration: parse_field(fields[6], "reference duration")?,
    })
}

fn parse_field<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| anyhow!("invalid {}: {:?}", what, raw))
}

/// An empty field is an undetected marker, not an error.
fn parse_marker(raw: &str, what: &str) -> Result<Option<u64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    parse_field(raw, what).map(Some)
}

fn check_rows(
    rows: &[LogRow],
    threshold: i64,
    mut on_row: impl FnMut(usize, &LogRow),
) -> CheckReport {
    let mut report = CheckReport {
        rows: rows.len(),
        ..CheckReport::default()
    };
    let mut prev: Option<&LogRow> = None;
    for (i, row) in rows.iter().enumerate() {
        on_row(i, row);
        if row.valid_frame_index != i as u64 {
            report.violations.push(format!(
                "row {}: valid frame index {} (expected {})",
                i, row.valid_frame_index, i
            ));
        }
        if row.marker_upper.is_none() && row.marker_lower.is_none() {
            report.violations.push(format!(
                "row {}: neither marker decoded; the row should not have been logged",
                i
            ));
        }
        if row.frame_ref_duration <= 0 {
            report.violations.push(format!(
                "row {}: non-positive frame duration {}",
                i, row.frame_ref_duration
            ));
        }
        if !report.durations.contains(&row.frame_ref_duration) {
            report.durations.push(row.frame_ref_duration);
        }
        if let Some(prev) = prev {
            if row.frame_ref_timestamp <= prev.frame_ref_timestamp {
                report.violations.push(format!(
                    "row {}: reference timestamp {} does not advance past {}",
                    i, row.frame_ref_timestamp, prev.frame_ref_timestamp
                ));
            }
            let gap = row.hw_timestamp - prev.hw_timestamp;
            if gap > report.max_gap {
                report.max_gap = gap;
            }
            if gap > threshold {
                report.late_rows += 1;
            }
        }
        prev = Some(row);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use synctrace::{EventLog, LogEntry, MarkerPair};

    fn row(index: u64, upper: Option<u64>, lower: Option<u64>, hw: i64, rt: i64) -> LogRow {
        LogRow {
            valid_frame_index: index,
            marker_upper: upper,
            marker_lower: lower,
            wall_clock_us: 1_700_000_000_000_000 + hw,
            hw_timestamp: hw,
            frame_ref_timestamp: rt,
            frame_ref_duration: 16_683,
        }
    }

    #[test]
    fn parse_row_reads_all_fields() -> Result<()> {
        let row = parse_row("3,42,99,1700000000000000,50049,50049,16683")?;
        assert_eq!(row.valid_frame_index, 3);
        assert_eq!(row.marker_upper, Some(42));
        assert_eq!(row.marker_lower, Some(99));
        assert_eq!(row.wall_clock_us, 1_700_000_000_000_000);
        assert_eq!(row.hw_timestamp, 50_049);
        assert_eq!(row.frame_ref_timestamp, 50_049);
        assert_eq!(row.frame_ref_duration, 16_683);
        Ok(())
    }

    #[test]
    fn parse_row_treats_empty_markers_as_absent() -> Result<()> {
        let row = parse_row("0,,7,1700000000000000,0,0,16683")?;
        assert_eq!(row.marker_upper, None);
        assert_eq!(row.marker_lower, Some(7));
        Ok(())
    }

    #[test]
    fn parse_row_rejects_short_rows() {
        assert!(parse_row("0,1,2,3").is_err());
        assert!(parse_row("0,x,2,3,4,5,6").is_err());
    }

    #[test]
    fn parse_log_skips_headers_and_blank_lines() -> Result<()> {
        let text =
            "# capture log\n# columns\n\n0,1,,10,100,100,16683\n1,2,,10,116783,116783,16683\n";
        let rows = parse_log(text)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].valid_frame_index, 0);
        assert_eq!(rows[1].marker_upper, Some(2));
        Ok(())
    }

    #[test]
    fn parse_log_reports_the_failing_line() {
        let text = "# header\n0,1,,10,100,100,16683\nnot,a,row\n";
        let err = parse_log(text).unwrap_err();
        assert!(format!("{:#}", err).contains("log line 3"));
    }

    #[test]
    fn clean_log_passes() {
        let rows = vec![
            row(0, Some(1), None, 0, 0),
            row(1, Some(2), None, 16_683, 16_683),
            row(2, Some(3), Some(3), 33_366, 33_366),
        ];
        let report = check_rows(&rows, 20_000, |_, _| {});
        assert!(report.violations.is_empty());
        assert_eq!(report.rows, 3);
        assert_eq!(report.late_rows, 0);
        assert_eq!(report.max_gap, 16_683);
        assert_eq!(report.durations, vec![16_683]);
    }

    #[test]
    fn index_gap_is_a_violation() {
        let rows = vec![row(0, Some(1), None, 0, 0), row(2, Some(2), None, 16_683, 16_683)];
        let report = check_rows(&rows, 20_000, |_, _| {});
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].contains("expected 1"));
    }

    #[test]
    fn markerless_row_is_a_violation() {
        let rows = vec![row(0, None, None, 0, 0)];
        let report = check_rows(&rows, 20_000, |_, _| {});
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].contains("neither marker"));
    }

    #[test]
    fn stalled_reference_timestamp_is_a_violation() {
        let rows = vec![
            row(0, Some(1), None, 0, 100),
            row(1, Some(2), None, 16_683, 100),
        ];
        let report = check_rows(&rows, 20_000, |_, _| {});
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].contains("does not advance"));
    }

    #[test]
    fn late_gap_is_counted_not_failed() {
        let rows = vec![
            row(0, Some(1), None, 0, 0),
            row(1, Some(2), None, 34_000, 16_683),
        ];
        let report = check_rows(&rows, 20_000, |_, _| {});
        assert!(report.violations.is_empty());
        assert_eq!(report.late_rows, 1);
        assert_eq!(report.max_gap, 34_000);
    }

    #[test]
    fn empty_log_passes() {
        let report = check_rows(&[], 20_000, |_, _| {});
        assert!(report.violations.is_empty());
        assert_eq!(report.rows, 0);
    }

    #[test]
    fn accepts_logs_written_by_the_event_log() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let mut log = EventLog::file(file.path(), None)?;
        for i in 0..3 {
            log.append(&LogEntry {
                valid_frame_index: i,
                markers: MarkerPair::new(Some(i + 10), if i == 1 { None } else { Some(i) }),
                wall_clock_us: 1_700_000_000_000_000 + i as i64 * 16_683,
                hw_timestamp: i as i64 * 16_683,
                frame_ref_timestamp: i as i64 * 16_683,
                frame_ref_duration: 16_683,
            })?;
        }
        drop(log);

        let mut text = String::new();
        file.reopen()?.read_to_string(&mut text)?;
        let rows = parse_log(&text)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].marker_lower, None);

        let report = check_rows(&rows, 20_000, |_, _| {});
        assert!(report.violations.is_empty());
        assert_eq!(report.late_rows, 0);
        Ok(())
    }
}
