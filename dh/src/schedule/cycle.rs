//! Recurrence rules and next-run computation
//!
//! Times are wall-clock times in the task's timezone. A wall-clock time that
//! falls into a spring-forward gap keeps the offset in force before the gap
//! (02:30 becomes 03:30); a repeated time in a fall-back overlap resolves to
//! its earlier occurrence.

use std::fmt;

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::cron::CronExpr;
use super::error::ScheduleError;

/// How often a task runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Cycle {
    Once { at: NaiveDateTime },
    Daily { time: NaiveTime },
    Weekly { weekday: Weekday, time: NaiveTime },
    /// Months shorter than `day` run on their last day
    Monthly { day: u32, time: NaiveTime },
    /// Feb 29 runs on Feb 28 in common years
    Yearly { month: u32, day: u32, time: NaiveTime },
    Cron { expression: CronExpr },
}

impl Cycle {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Once { .. } => "once",
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Monthly { .. } => "monthly",
            Self::Yearly { .. } => "yearly",
            Self::Cron { .. } => "cron",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }

    /// Range checks for the cycle details
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Monthly { day, .. } if !(1..=31).contains(day) => Err(ScheduleError::DayOfMonth(*day)),
            Self::Yearly { month, .. } if !(1..=12).contains(month) => Err(ScheduleError::Month(*month)),
            // Checked against a leap year so Feb 29 is accepted
            Self::Yearly { month, day, .. } if *day < 1 || *day > days_in_month(2000, *month) => Err(ScheduleError::Day {
                month: *month,
                day: *day,
            }),
            _ => Ok(()),
        }
    }

    /// First run strictly after `after`, or `None` if there is none
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let today = after.with_timezone(&tz).date_naive();

        match self {
            Self::Once { at } => resolve_local(tz, *at).filter(|t| *t > after),
            Self::Daily { time } => (0..=2)
                .filter_map(|offset| today.checked_add_signed(TimeDelta::days(offset)))
                .filter_map(|date| resolve_local(tz, date.and_time(*time)))
                .find(|t| *t > after),
            Self::Weekly { weekday, time } => (0..=8)
                .filter_map(|offset| today.checked_add_signed(TimeDelta::days(offset)))
                .filter(|date| date.weekday() == *weekday)
                .filter_map(|date| resolve_local(tz, date.and_time(*time)))
                .find(|t| *t > after),
            Self::Monthly { day, time } => (0..=13)
                .filter_map(|offset| add_months(today.year(), today.month(), offset))
                .filter_map(|(year, month)| clamped_date(year, month, *day))
                .filter_map(|date| resolve_local(tz, date.and_time(*time)))
                .find(|t| *t > after),
            Self::Yearly { month, day, time } => (0..=2)
                .filter_map(|offset| clamped_date(today.year() + offset, *month, *day))
                .filter_map(|date| resolve_local(tz, date.and_time(*time)))
                .find(|t| *t > after),
            Self::Cron { expression } => expression.next_after(after, tz),
        }
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once { at } => write!(f, "once at {}", at.format("%Y-%m-%d %H:%M")),
            Self::Daily { time } => write!(f, "daily at {}", time.format("%H:%M")),
            Self::Weekly { weekday, time } => write!(f, "weekly on {} at {}", weekday, time.format("%H:%M")),
            Self::Monthly { day, time } => write!(f, "monthly on day {} at {}", day, time.format("%H:%M")),
            Self::Yearly { month, day, time } => {
                write!(f, "yearly on {:02}-{:02} at {}", month, day, time.format("%H:%M"))
            }
            Self::Cron { expression } => write!(f, "cron '{}'", expression),
        }
    }
}

/// Map a local wall-clock time to an instant
pub fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        LocalResult::None => {
            // Gap: apply the offset in force a few hours earlier
            let before = tz.from_local_datetime(&(local - TimeDelta::hours(3))).earliest()?;
            let offset = before.offset().fix();
            offset
                .from_local_datetime(&local)
                .single()
                .map(|t| t.with_timezone(&Utc))
        }
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// `day` in the given month, clamped to the month's last day
fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)))
}

fn add_months(year: i32, month: u32, offset: u32) -> Option<(i32, u32)> {
    let index = year.checked_mul(12)? + (month as i32 - 1) + offset as i32;
    Some((index.div_euclid(12), index.rem_euclid(12) as u32 + 1))
}

/// Parse `HH:MM` or `HH:MM:SS`
pub fn parse_time(s: &str) -> Result<NaiveTime, ScheduleError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| ScheduleError::Time(s.to_string()))
}

/// Parse `YYYY-MM-DD HH:MM` (a `T` separator is also accepted)
pub fn parse_datetime(s: &str) -> Result<NaiveDateTime, ScheduleError> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| ScheduleError::DateTime(s.to_string()))
}

pub fn parse_weekday(s: &str) -> Result<Weekday, ScheduleError> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| ScheduleError::Weekday(s.to_string()))
}

/// Parse an IANA timezone name
pub fn parse_timezone(s: &str) -> Result<Tz, ScheduleError> {
    s.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::Timezone(s.to_string()))
}
