//! Frame arrival timing checks.
//!
//! The capture hardware stamps every frame with a reference timestamp taken
//! from its own clock. This module is responsible for:
//!
//! - Seeding a baseline from the first stamped frame of a stream.
//! - Classifying every later frame by its delta from the previous stamp.
//! - Flagging frames whose delta exceeds the configured threshold, which is
//!   how dropped or stalled capture shows up in practice.
//!
//! It MUST NOT touch wall-clock time; both sides of the comparison come from
//! the hardware reference clock.

use anyhow::{anyhow, Result};

/// Resolution of the hardware reference clock, in ticks per second.
pub const TICKS_PER_SECOND: i64 = 1_000_000;

/// Default late threshold: 20ms on the hardware clock.
pub const DEFAULT_LATE_THRESHOLD_TICKS: i64 = 20_000;

// ----------------------------------------------------------------------------
// Verdicts and policy
// ----------------------------------------------------------------------------

/// Classification of one frame's reference timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingVerdict {
    /// First stamped frame of the stream; it seeds the reference and is never
    /// considered late.
    Baseline,
    /// Delta from the previous stamp is within the threshold.
    OnTime { delta: i64 },
    /// Delta from the previous stamp exceeded the threshold.
    Late { delta: i64 },
}

impl TimingVerdict {
    pub fn is_late(&self) -> bool {
        matches!(self, TimingVerdict::Late { .. })
    }
}

/// What the session does when a frame is classified late.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LateFramePolicy {
    /// Raise the exit signal and stop processing frames. The run is reported
    /// as failed.
    #[default]
    Abort,
    /// Log a warning and keep capturing.
    Warn,
}

impl LateFramePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            LateFramePolicy::Abort => "abort",
            LateFramePolicy::Warn => "warn",
        }
    }

    /// Parse a configuration token ("abort", "warn").
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "abort" => Ok(LateFramePolicy::Abort),
            "warn" => Ok(LateFramePolicy::Warn),
            other => Err(anyhow!(
                "unknown late-frame policy '{}' (expected abort or warn)",
                other
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// TimingValidator
// ----------------------------------------------------------------------------

/// Tracks the previous reference timestamp and classifies each new one.
///
/// The reference always advances to the most recent stamp, including after a
/// late verdict; under a warn policy the validator keeps measuring gaps
/// between consecutive frames rather than accumulating drift against an old
/// baseline.
#[derive(Debug)]
pub struct TimingValidator {
    previous: Option<i64>,
    threshold_ticks: i64,
}

impl TimingValidator {
    pub fn new(threshold_ticks: i64) -> Self {
        Self {
            previous: None,
            threshold_ticks,
        }
    }

    pub fn with_default_threshold() -> Self {
        Self::new(DEFAULT_LATE_THRESHOLD_TICKS)
    }

    pub fn threshold_ticks(&self) -> i64 {
        self.threshold_ticks
    }

    /// Classify the next reference timestamp and advance the internal state.
    pub fn check(&mut self, timestamp: i64) -> TimingVerdict {
        let verdict = match self.previous {
            None => TimingVerdict::Baseline,
            Some(previous) => {
                let delta = timestamp - previous;
                if delta > self.threshold_ticks {
                    TimingVerdict::Late { delta }
                } else {
                    TimingVerdict::OnTime { delta }
                }
            }
        };
        self.previous = Some(timestamp);
        verdict
    }

    /// Forget the reference timestamp; the next frame seeds a new baseline.
    /// Called when streaming restarts and the clock origin may have moved.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_seeds_baseline() {
        let mut validator = TimingValidator::with_default_threshold();
        assert_eq!(validator.check(1_000), TimingVerdict::Baseline);
    }

    #[test]
    fn steady_cadence_stays_on_time() {
        let mut validator = TimingValidator::with_default_threshold();
        let stamps = [1_000_000, 1_016_000, 1_032_000, 1_048_000, 1_064_000];
        assert_eq!(validator.check(stamps[0]), TimingVerdict::Baseline);
        for pair in stamps.windows(2) {
            let verdict = validator.check(pair[1]);
            assert_eq!(
                verdict,
                TimingVerdict::OnTime {
                    delta: pair[1] - pair[0]
                }
            );
        }
    }

    #[test]
    fn gap_over_threshold_is_late() {
        let mut validator = TimingValidator::with_default_threshold();
        validator.check(1_000_000);
        validator.check(1_016_000);
        let verdict = validator.check(1_050_000);
        assert_eq!(verdict, TimingVerdict::Late { delta: 34_000 });
    }

    #[test]
    fn delta_at_threshold_is_on_time() {
        let mut validator = TimingValidator::new(20_000);
        validator.check(0);
        assert_eq!(validator.check(20_000), TimingVerdict::OnTime { delta: 20_000 });
        assert!(validator.check(40_001).is_late());
    }

    #[test]
    fn reference_advances_after_late_frame() {
        let mut validator = TimingValidator::new(20_000);
        validator.check(0);
        assert!(validator.check(100_000).is_late());
        // Next delta is measured from the late frame, not the old baseline.
        assert_eq!(
            validator.check(116_000),
            TimingVerdict::OnTime { delta: 16_000 }
        );
    }

    #[test]
    fn reset_reseeds_baseline() {
        let mut validator = TimingValidator::with_default_threshold();
        validator.check(1_000);
        validator.reset();
        assert_eq!(validator.check(5_000_000), TimingVerdict::Baseline);
    }

    #[test]
    fn policy_parse() {
        assert_eq!(LateFramePolicy::parse("abort").unwrap(), LateFramePolicy::Abort);
        assert_eq!(LateFramePolicy::parse("warn").unwrap(), LateFramePolicy::Warn);
        assert!(LateFramePolicy::parse("panic").is_err());
        assert_eq!(LateFramePolicy::default(), LateFramePolicy::Abort);
    }
}
