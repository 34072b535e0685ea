//! Analytics storage models

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::analytics::models::DATE_FORMAT;

/// Inclusive date range used by every rollup query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range; bounds given in the wrong order are swapped
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// The `days` most recent days ending at `today` (inclusive)
    pub fn last_days(today: NaiveDate, days: u32) -> Self {
        let span = u64::from(days.max(1)) - 1;
        Self::new(today - Days::new(span), today)
    }

    pub fn start_key(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    pub fn end_key(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }

    /// Whether a stored `YYYY-MM-DD` date falls inside the range
    pub fn contains(&self, date: &str) -> bool {
        date >= self.start_key().as_str() && date <= self.end_key().as_str()
    }
}

/// Path rollup row as stored
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PathStat {
    pub date: String,
    pub path: String,
    pub pageviews: i64,
    pub visitors: i64,
    pub duration_sum_ms: i64,
    pub duration_samples: i64,
}

impl PathStat {
    /// Average time on page, if any duration was reported
    pub fn avg_duration_ms(&self) -> Option<i64> {
        (self.duration_samples > 0).then(|| self.duration_sum_ms / self.duration_samples)
    }
}

/// Pageviews and visitors of one path summed over a date range
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PathTotal {
    pub path: String,
    pub pageviews: i64,
    pub visitors: i64,
}

/// Visitors of one referrer domain summed over a date range
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SourceTotal {
    pub source: String,
    pub visitors: i64,
}

/// Visitors of one browser/OS pair summed over a date range
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DeviceTotal {
    pub browser: String,
    pub os: String,
    pub visitors: i64,
}
