//! Host clock adapter.
//!
//! Implements [`Clock`] with the `embassy-time` std driver for monotonic
//! time and `std::time::SystemTime` for the wall clock.  The local offset
//! is whatever the host was configured with; the host is expected to call
//! [`SystemClock::set_utc_offset`] when its timezone changes.

use core::sync::atomic::{AtomicI16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use embassy_time::Instant;
use log::warn;

use crate::app::ports::Clock;
use crate::pod::TimeZoneOffset;

const DAY_SECS: u64 = 86_400;

/// Host time source.
pub struct SystemClock {
    offset_minutes: AtomicI16,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(TimeZoneOffset::UTC)
    }
}

impl SystemClock {
    pub fn new(offset: TimeZoneOffset) -> Self {
        Self {
            offset_minutes: AtomicI16::new(offset.minutes()),
        }
    }

    /// Host moved to another timezone.  Takes effect on the next
    /// `sync_time`.
    pub fn set_utc_offset(&self, offset: TimeZoneOffset) {
        self.offset_minutes.store(offset.minutes(), Ordering::Relaxed);
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_seconds_of_day(&self) -> u32 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since_epoch) => (since_epoch.as_secs() % DAY_SECS) as u32,
            Err(_) => {
                warn!("SystemClock: wall clock before 1970, using midnight");
                0
            }
        }
    }

    fn utc_offset(&self) -> TimeZoneOffset {
        TimeZoneOffset::from_minutes(self.offset_minutes.load(Ordering::Relaxed))
            .unwrap_or(TimeZoneOffset::UTC)
    }
}
