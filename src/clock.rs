//! Fixed-offset local wall clock
//!
//! Local time is always `UTC + offset_minutes`, computed with plain chrono
//! arithmetic on the UTC timescale. Nothing here reads the host timezone,
//! so results are identical on every machine.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use thiserror::Error;

use crate::rule::MAX_OFFSET_MINUTES;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    #[error("UTC offset of {0} minutes is not representable")]
    InvalidOffset(i32),
    #[error("calendar arithmetic overflowed near {0}")]
    OutOfRange(DateTime<Utc>),
}

/// Derived local view of an instant. Never stored, always recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalWallClock {
    pub weekday: Weekday,
    pub hour: u32,
    pub minute: u32,
}

impl LocalWallClock {
    /// Minutes since local Sunday 00:00
    pub fn week_minutes(&self) -> i64 {
        self.weekday.num_days_from_sunday() as i64 * 1440 + self.hour as i64 * 60 + self.minute as i64
    }
}

/// Converts between UTC and a fixed-offset local wall clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalClock {
    offset: FixedOffset,
}

impl LocalClock {
    pub fn new(offset_minutes: i32) -> Result<Self, ClockError> {
        if offset_minutes.unsigned_abs() > MAX_OFFSET_MINUTES.unsigned_abs() {
            return Err(ClockError::InvalidOffset(offset_minutes));
        }
        let offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or(ClockError::InvalidOffset(offset_minutes))?;
        Ok(Self { offset })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    fn to_local(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset)
    }

    pub fn wall_clock(&self, instant: DateTime<Utc>) -> LocalWallClock {
        let local = self.to_local(instant);
        LocalWallClock {
            weekday: local.weekday(),
            hour: local.hour(),
            minute: local.minute(),
        }
    }

    /// Local (hour, minute) of `instant`
    pub fn to_local_hhmm(&self, instant: DateTime<Utc>) -> (u32, u32) {
        let local = self.to_local(instant);
        (local.hour(), local.minute())
    }

    /// Zero-padded 24-hour `HH:MM`; seconds are truncated
    pub fn format_hhmm(&self, instant: DateTime<Utc>) -> String {
        let (hour, minute) = self.to_local_hhmm(instant);
        format!("{:02}:{:02}", hour, minute)
    }

    /// Local noon on the next date (today included) whose local weekday is
    /// `target`, returned as a UTC instant.
    ///
    /// Noon is a stable date reference for the ephemeris: it is far from
    /// either date boundary. If `now` is already past noon on the target
    /// day the result lies in the past; the due check runs separately.
    pub fn next_occurrence_anchor(
        &self,
        now: DateTime<Utc>,
        target: Weekday,
    ) -> Result<DateTime<Utc>, ClockError> {
        let local = self.to_local(now);
        let today = local.weekday().num_days_from_sunday();
        let add_days = (target.num_days_from_sunday() + 7 - today) % 7;

        let date = local
            .date_naive()
            .checked_add_days(Days::new(add_days as u64))
            .ok_or(ClockError::OutOfRange(now))?;
        let noon = date.and_time(NaiveTime::from_hms_opt(12, 0, 0).ok_or(ClockError::OutOfRange(now))?);

        self.offset
            .from_local_datetime(&noon)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(ClockError::OutOfRange(now))
    }
}

/// Shorthand for `LocalClock::new(offset)?.next_occurrence_anchor(now, target)`
pub fn next_occurrence_anchor(
    now: DateTime<Utc>,
    target: Weekday,
    offset_minutes: i32,
) -> Result<DateTime<Utc>, ClockError> {
    LocalClock::new(offset_minutes)?.next_occurrence_anchor(now, target)
}

/// Shorthand for `LocalClock::new(offset)?.to_local_hhmm(instant)`
pub fn to_local_hhmm(instant: DateTime<Utc>, offset_minutes: i32) -> Result<(u32, u32), ClockError> {
    Ok(LocalClock::new(offset_minutes)?.to_local_hhmm(instant))
}
