//! Aggregation windows for time-bucketed job outcome series.
//!
//! A window string is `<positive integer><unit>` with unit `m`, `h` or `d`
//! (`"30m"`, `"3h"`, `"7d"`). It yields `amount` contiguous buckets of one unit
//! each, the last of which contains "now".

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::job::JobStatus;
use crate::timestamp;

/// Largest accepted bucket count.
pub const MAX_BUCKETS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowUnit {
    Minute,
    Hour,
    Day,
}

impl WindowUnit {
    fn from_suffix(c: char) -> Option<Self> {
        match c {
            'm' => Some(WindowUnit::Minute),
            'h' => Some(WindowUnit::Hour),
            'd' => Some(WindowUnit::Day),
            _ => None,
        }
    }

    pub fn suffix(&self) -> char {
        match self {
            WindowUnit::Minute => 'm',
            WindowUnit::Hour => 'h',
            WindowUnit::Day => 'd',
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            WindowUnit::Minute => Duration::minutes(1),
            WindowUnit::Hour => Duration::hours(1),
            WindowUnit::Day => Duration::days(1),
        }
    }

    /// Truncate to the start of the enclosing unit (UTC).
    pub fn truncate(&self, ts: DateTime<Utc>) -> Result<DateTime<Utc>, DomainError> {
        ts.duration_trunc(self.duration())
            .map_err(|e| DomainError::invalid_window(format!("cannot truncate {ts}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    amount: u32,
    unit: WindowUnit,
}

impl Window {
    pub fn new(amount: u32, unit: WindowUnit) -> Result<Self, DomainError> {
        if amount == 0 {
            return Err(DomainError::invalid_window("amount must be positive"));
        }
        if amount > MAX_BUCKETS {
            return Err(DomainError::invalid_window(format!(
                "amount must be at most {MAX_BUCKETS}"
            )));
        }
        Ok(Self { amount, unit })
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::invalid_window(format!("{raw:?} (expected e.g. 30m, 3h, 7d)"));

        let suffix = raw.chars().last().ok_or_else(invalid)?;
        let unit = WindowUnit::from_suffix(suffix).ok_or_else(invalid)?;
        let digits = &raw[..raw.len() - suffix.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let amount: u32 = digits.parse().map_err(|_| invalid())?;
        Window::new(amount, unit).map_err(|_| invalid())
    }

    pub fn amount(&self) -> u32 {
        self.amount
    }

    pub fn unit(&self) -> WindowUnit {
        self.unit
    }

    /// Bucket start times, ascending; the last one is `now` truncated to the unit.
    pub fn bucket_starts(&self, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, DomainError> {
        let end = self.unit.truncate(now)?;
        let step = self.unit.duration();
        Ok((0..self.amount)
            .rev()
            .map(|back| end - step * back as i32)
            .collect())
    }

    /// Half-open time range covered by all buckets: `[first start, last start + unit)`.
    pub fn range(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), DomainError> {
        let end = self.unit.truncate(now)?;
        let step = self.unit.duration();
        let start = end - step * (self.amount as i32 - 1);
        Ok((start, end + step))
    }

    /// Count outcomes per bucket. Rows outside the window and non-terminal
    /// statuses are ignored; empty buckets are reported as zeros.
    pub fn tally<I>(&self, now: DateTime<Utc>, rows: I) -> Result<Vec<SeriesPoint>, DomainError>
    where
        I: IntoIterator<Item = (DateTime<Utc>, JobStatus)>,
    {
        let starts = self.bucket_starts(now)?;
        let (from, to) = self.range(now)?;
        let step_ms = self.unit.duration().num_milliseconds();

        let mut points: Vec<SeriesPoint> = starts
            .into_iter()
            .map(|timestamp| SeriesPoint {
                timestamp,
                success: 0,
                failed: 0,
            })
            .collect();

        for (created_at, status) in rows {
            if created_at < from || created_at >= to {
                continue;
            }
            let idx = ((created_at - from).num_milliseconds() / step_ms) as usize;
            let Some(point) = points.get_mut(idx) else {
                continue;
            };
            if status.is_success() {
                point.success += 1;
            } else if status == JobStatus::Failed {
                point.failed += 1;
            }
        }

        Ok(points)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

impl FromStr for Window {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Window::parse(s)
    }
}

/// One bucket of an outcome series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Bucket start (inclusive).
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub success: u64,
    pub failed: u64,
}
