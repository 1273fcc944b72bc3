//! Basal schedule and temporary basal values.
//!
//! A schedule is a fixed-capacity list of (rate, duration) segments that
//! together cover exactly one day.  Durations are whole half-hours, which is
//! the granularity the pod stores its basal table in.

use core::fmt;

use heapless::Vec;
use serde::{Deserialize, Serialize};

/// Maximum number of segments in one schedule.
pub const MAX_SEGMENTS: usize = 24;

/// Basal table granularity.
pub const SEGMENT_STEP_MINUTES: u16 = 30;

/// One day, in minutes.
pub const DAY_MINUTES: u32 = 24 * 60;

/// Highest basal or temp-basal rate the pod accepts (U/h).
pub const MAX_BASAL_RATE: f64 = 30.0;

/// Longest temp basal the pod accepts.
pub const MAX_TEMP_BASAL_MINUTES: u16 = 12 * 60;

/// Why a schedule or temp basal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    Empty,
    TooManySegments,
    /// Segment duration is zero or not a multiple of 30 minutes.
    BadDuration,
    /// Segments do not add up to 24 hours.
    NotOneDay,
    RateOutOfRange,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "schedule has no segments"),
            Self::TooManySegments => write!(f, "schedule exceeds {} segments", MAX_SEGMENTS),
            Self::BadDuration => write!(f, "segment duration must be a positive multiple of 30 min"),
            Self::NotOneDay => write!(f, "segments must cover exactly 24 hours"),
            Self::RateOutOfRange => write!(f, "rate outside 0..={} U/h", MAX_BASAL_RATE),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// A single (rate, duration) entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BasalSegment {
    /// Units per hour.
    pub rate: f64,
    pub duration_minutes: u16,
}

impl BasalSegment {
    pub const fn new(rate: f64, duration_minutes: u16) -> Self {
        Self {
            rate,
            duration_minutes,
        }
    }
}

/// Validated basal schedule covering one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalSchedule {
    segments: Vec<BasalSegment, MAX_SEGMENTS>,
}

impl BasalSchedule {
    pub fn new(segments: &[BasalSegment]) -> Result<Self, ScheduleError> {
        if segments.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let mut stored = Vec::new();
        let mut total: u32 = 0;
        for segment in segments {
            if segment.duration_minutes == 0 || segment.duration_minutes % SEGMENT_STEP_MINUTES != 0 {
                return Err(ScheduleError::BadDuration);
            }
            if !(0.0..=MAX_BASAL_RATE).contains(&segment.rate) {
                return Err(ScheduleError::RateOutOfRange);
            }
            total += u32::from(segment.duration_minutes);
            stored
                .push(*segment)
                .map_err(|_| ScheduleError::TooManySegments)?;
        }
        if total != DAY_MINUTES {
            return Err(ScheduleError::NotOneDay);
        }
        Ok(Self { segments: stored })
    }

    /// Flat schedule: one rate all day.
    pub fn flat(rate: f64) -> Result<Self, ScheduleError> {
        Self::new(&[BasalSegment::new(rate, DAY_MINUTES as u16)])
    }

    pub fn segments(&self) -> &[BasalSegment] {
        &self.segments
    }

    /// Rate in effect at `offset_secs` seconds after local midnight.
    pub fn rate_at(&self, offset_secs: u32) -> f64 {
        let minute = (offset_secs / 60) % DAY_MINUTES;
        let mut start = 0u32;
        for segment in &self.segments {
            let end = start + u32::from(segment.duration_minutes);
            if minute < end {
                return segment.rate;
            }
            start = end;
        }
        // Unreachable for a validated schedule; fall back to the last rate.
        self.segments.last().map_or(0.0, |s| s.rate)
    }

    /// Units delivered over a full day.
    pub fn daily_total(&self) -> f64 {
        self.segments
            .iter()
            .map(|s| s.rate * f64::from(s.duration_minutes) / 60.0)
            .sum()
    }
}

/// A temporary basal: rate (U/h) and duration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempBasal {
    pub rate: f64,
    pub duration_minutes: u16,
}

impl TempBasal {
    pub fn new(rate: f64, duration_minutes: u16) -> Result<Self, ScheduleError> {
        if !(0.0..=MAX_BASAL_RATE).contains(&rate) {
            return Err(ScheduleError::RateOutOfRange);
        }
        if duration_minutes == 0
            || duration_minutes > MAX_TEMP_BASAL_MINUTES
            || duration_minutes % SEGMENT_STEP_MINUTES != 0
        {
            return Err(ScheduleError::BadDuration);
        }
        Ok(Self {
            rate,
            duration_minutes,
        })
    }
}
