//! Five-field cron expressions
//!
//! Fields are minute, hour, day of month, month and day of week. Each field
//! accepts `*`, lists, ranges and steps; months and weekdays also accept
//! three-letter names, and weekday 7 is Sunday. When both day fields are
//! restricted a day matches if either does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::error::ScheduleError;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Search horizon for the next match; covers leap-day-only expressions
const SEARCH_YEARS: i32 = 5;

/// Parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    /// Day-of-month field was unrestricted (`*` or `*/n`)
    dom_star: bool,
    /// Day-of-week field was unrestricted
    dow_star: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let source = expression.trim().to_string();
        let expanded = match source.to_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            _ => source.clone(),
        };

        let err = |reason: String| ScheduleError::Cron {
            expression: source.clone(),
            reason,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(err(format!("expected 5 fields, got {}", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59, &[], 0).map_err(&err)?;
        let hours = parse_field(fields[1], 0, 23, &[], 0).map_err(&err)?;
        let days = parse_field(fields[2], 1, 31, &[], 0).map_err(&err)?;
        let months = parse_field(fields[3], 1, 12, &MONTH_NAMES, 1).map_err(&err)?;
        let mut weekdays = parse_field(fields[4], 0, 7, &WEEKDAY_NAMES, 0).map_err(&err)?;

        // 7 and 0 are both Sunday
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        Ok(Self {
            source,
            minutes,
            hours,
            days,
            months,
            weekdays,
            dom_star: fields[2].starts_with('*'),
            dow_star: fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        let dom = has(self.days, date.day());
        let dow = has(self.weekdays, date.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star { dom && dow } else { dom || dow }
    }

    /// First matching minute strictly after `after`, evaluated in `tz`
    ///
    /// Local minutes that do not exist are skipped; repeated local minutes
    /// fire on their first occurrence only.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t = local.date().and_hms_opt(local.hour(), local.minute(), 0)? + TimeDelta::minutes(1);
        let limit = t + TimeDelta::days(366 * SEARCH_YEARS as i64);

        while t <= limit {
            if !has(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.matches_date(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + TimeDelta::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += TimeDelta::minutes(1);
                continue;
            }

            if let Some(at) = tz.from_local_datetime(&t).earliest() {
                let at = at.with_timezone(&Utc);
                if at > after {
                    return Some(at);
                }
            }
            t += TimeDelta::minutes(1);
        }
        None
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Parse one field into a bitmask over `min..=max`
fn parse_field(field: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in '{}'", field));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be at least 1".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, names, name_base)?, value(b, names, name_base)?)
        } else {
            let v = value(range, names, name_base)?;
            // "5/15" means from 5 to the end of the range
            (v, if step.is_some() { max } else { v })
        };

        if lo < min || hi > max {
            return Err(format!("'{}' is outside {}-{}", part, min, max));
        }
        if lo > hi {
            return Err(format!("range '{}' is reversed", part));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn value(token: &str, names: &[&str], name_base: u32) -> Result<u32, String> {
    if let Ok(v) = token.parse::<u32>() {
        return Ok(v);
    }
    let lower = token.to_lowercase();
    names
        .iter()
        .position(|n| *n == lower)
        .map(|i| i as u32 + name_base)
        .ok_or_else(|| format!("invalid value '{}'", token))
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl FromStr for CronExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronExpr {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronExpr> for String {
    fn from(expr: CronExpr) -> Self {
        expr.source
    }
}
