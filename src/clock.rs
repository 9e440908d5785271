//! Node time base: local uptime corrected by a learned drift ratio and offset,
//! plus UTC calendar conversions.

use serde::{Deserialize, Serialize};

const MS_PER_SECOND: u64 = 1000;
const SECONDS_PER_DAY: u64 = 86_400;
const EPOCH_YEAR: u16 = 1970;
/// Century the two-digit compact year is read back in.
pub const COMPACT_CENTURY: u16 = 2000;
const DAYS_IN_MONTH: [u8; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    #[error("expected 12 digits, got {0:?}")]
    BadDigits(String),
    #[error("calendar field out of range")]
    OutOfRange,
}

pub fn is_leap_year(year: u16) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

pub fn days_in_month(year: u16, month: u8) -> u8 {
    if month == 2 && is_leap_year(year) {
        29
    } else {
        DAYS_IN_MONTH[usize::from(month.saturating_sub(1)).min(11)]
    }
}

/// Human-readable UTC instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalendarTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub millisecond: u16,
}

impl CalendarTime {
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Result<Self, CalendarError> {
        let cal = Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
            millisecond: 0,
        };
        if cal.is_valid() {
            Ok(cal)
        } else {
            Err(CalendarError::OutOfRange)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.year >= EPOCH_YEAR
            && (1..=12).contains(&self.month)
            && self.day >= 1
            && self.day <= days_in_month(self.year, self.month)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
            && self.millisecond < 1000
    }

    /// Parse the compact `YYMMDDHHMMSS` form used on the radio. `YY` maps to `20YY`.
    pub fn from_compact(digits: &str) -> Result<Self, CalendarError> {
        if digits.len() != 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CalendarError::BadDigits(digits.to_string()));
        }
        let field = |i: usize| -> u8 {
            let b = digits.as_bytes();
            (b[i] - b'0') * 10 + (b[i + 1] - b'0')
        };
        Self::new(
            COMPACT_CENTURY + u16::from(field(0)),
            field(2),
            field(4),
            field(6),
            field(8),
            field(10),
        )
    }

    /// Whether the compact form reads back as the same year.
    pub fn fits_compact(&self) -> bool {
        (COMPACT_CENTURY..COMPACT_CENTURY + 100).contains(&self.year)
    }

    /// Render as `YYMMDDHHMMSS`, dropping milliseconds. Only lossless when
    /// [`fits_compact`](Self::fits_compact) holds.
    pub fn to_compact(&self) -> String {
        format!(
            "{:02}{:02}{:02}{:02}{:02}{:02}",
            self.year % 100,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second
        )
    }
}

impl core::fmt::Display for CalendarTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            self.year, self.month, self.day, self.hour, self.minute, self.second, self.millisecond
        )
    }
}

/// Convert Unix milliseconds to calendar time (proleptic Gregorian, UTC).
pub fn to_calendar(unix_ms: u64) -> CalendarTime {
    let millisecond = (unix_ms % MS_PER_SECOND) as u16;
    let mut seconds = unix_ms / MS_PER_SECOND;

    let second = (seconds % 60) as u8;
    seconds /= 60;
    let minute = (seconds % 60) as u8;
    seconds /= 60;
    let hour = (seconds % 24) as u8;
    let mut days = seconds / 24;

    let mut year = EPOCH_YEAR;
    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let mut month = 1u8;
    while month < 12 {
        let dim = u64::from(days_in_month(year, month));
        if days < dim {
            break;
        }
        days -= dim;
        month += 1;
    }

    CalendarTime {
        year,
        month,
        day: days as u8 + 1,
        hour,
        minute,
        second,
        millisecond,
    }
}

/// Convert calendar time back to Unix milliseconds.
pub fn from_calendar(cal: &CalendarTime) -> u64 {
    let mut days: u64 = (EPOCH_YEAR..cal.year)
        .map(|y| if is_leap_year(y) { 366 } else { 365 })
        .sum();
    days += (1..cal.month)
        .map(|m| u64::from(days_in_month(cal.year, m)))
        .sum::<u64>();
    days += u64::from(cal.day.saturating_sub(1));

    let seconds = days * SECONDS_PER_DAY
        + u64::from(cal.hour) * 3600
        + u64::from(cal.minute) * 60
        + u64::from(cal.second);
    seconds * MS_PER_SECOND + u64::from(cal.millisecond)
}

/// Local uptime plus the correction learned at the last sync event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockModel {
    /// Local milliseconds since boot, as of the last query.
    pub running_time: u64,
    pub last_sync_running_time: u64,
    pub drift_ratio: f64,
    pub time_offset: i64,
    /// Unified time computed by the last query.
    pub unified_time: u64,
}

impl ClockModel {
    pub fn new() -> Self {
        Self {
            running_time: 0,
            last_sync_running_time: 0,
            drift_ratio: 1.0,
            time_offset: 0,
            unified_time: 0,
        }
    }

    pub fn record_sync(&mut self, local_now: u64) {
        self.last_sync_running_time = local_now;
    }

    /// Reference sync: the offset is replaced, the drift ratio is left alone.
    pub fn apply_reference(&mut self, epoch_ms: u64, local_now: u64) {
        self.time_offset = epoch_ms as i64 - local_now as i64;
        self.record_sync(local_now);
    }

    /// Peer sync: drift ratio and offset change together with the sync stamp.
    pub fn apply_correction(&mut self, drift_ratio: f64, time_offset: i64, local_now: u64) {
        debug_assert!(drift_ratio > 0.0, "drift ratio {drift_ratio} must be positive");
        self.drift_ratio = drift_ratio;
        self.time_offset = time_offset;
        self.record_sync(local_now);
    }

    /// `last_sync + (now - last_sync) * drift + offset`, evaluated in f64.
    pub fn get_unified_time(&mut self, local_now: u64) -> u64 {
        self.running_time = local_now;
        let base = self.last_sync_running_time as f64;
        let delta = local_now.saturating_sub(self.last_sync_running_time) as f64;
        let adjusted = base + delta * self.drift_ratio + self.time_offset as f64;
        // Negative results saturate to zero.
        self.unified_time = adjusted as u64;
        self.unified_time
    }

    pub fn get_calendar(&mut self, local_now: u64) -> CalendarTime {
        to_calendar(self.get_unified_time(local_now))
    }
}

impl Default for ClockModel {
    fn default() -> Self {
        Self::new()
    }
}
