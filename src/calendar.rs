//! ISO-8601 week arithmetic and shard naming.
//!
//! Quotations are partitioned by ISO week-based year and week number. A
//! quarter database holds up to 13 week tables:
//!
//! - weeks 1-13  -> Q1
//! - weeks 14-26 -> Q2
//! - weeks 27-39 -> Q3
//! - weeks 40-53 -> Q4

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

pub fn one_hour() -> Duration {
    Duration::hours(1)
}

/// Identifies one week shard: `(ISO year, ISO week)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeekKey {
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn new(year: i32, week: u32) -> Self {
        Self { year, week }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self::from_date(ts.date_naive())
    }

    pub fn quarter(&self) -> u32 {
        quarter_of_week(self.week)
    }

    pub fn table_name(&self) -> String {
        table_name(self.week)
    }

    /// Monday 00:00 (inclusive) to the following Monday 00:00 (exclusive).
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let monday = NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)?;
        let start = monday.and_time(NaiveTime::MIN).and_utc();
        Some((start, start + Duration::weeks(1)))
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        match self.bounds() {
            Some((start, end)) => ts >= start && ts < end,
            None => false,
        }
    }
}

impl std::fmt::Display for WeekKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

/// Quarter (1-4) a given ISO week belongs to.
pub fn quarter_of_week(week: u32) -> u32 {
    match week {
        0..=13 => 1,
        14..=26 => 2,
        27..=39 => 3,
        _ => 4,
    }
}

/// Physical database name of a quarter: `{year}.{quarter}.{provider}`.
pub fn shard_name(year: i32, quarter: u32, provider: &str) -> String {
    format!("{}.{}.{}", year, quarter, provider.to_lowercase())
}

/// Table holding one week of quotations: `week{NN}`.
pub fn table_name(week: u32) -> String {
    format!("week{:02}", week)
}

/// Accepts only names produced by [`table_name`], so they are safe to splice into SQL.
pub fn is_valid_table_name(name: &str) -> bool {
    name.len() == 6
        && name.starts_with("week")
        && name[4..].bytes().all(|b| b.is_ascii_digit())
        && matches!(name[4..].parse::<u32>(), Ok(1..=53))
}

pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(ts.hour(), 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(ts)
}

/// Smallest hour boundary that is `>= ts`.
pub fn ceil_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floor = truncate_to_hour(ts);
    if floor == ts {
        floor
    } else {
        floor + one_hour()
    }
}

/// Hours since the Unix epoch; the key of the contributions ledger.
pub fn hour_number(ts: DateTime<Utc>) -> i64 {
    truncate_to_hour(ts).timestamp().div_euclid(3600)
}

pub fn hour_from_number(hour_number: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(hour_number.checked_mul(3600)?, 0)
}
