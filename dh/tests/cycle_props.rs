//! Property tests for schedule computations

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use proptest::prelude::*;

use dockhand::schedule::{CronExpr, Cycle, days_in_month};

const ZONES: &[&str] = &[
    "UTC",
    "Europe/Berlin",
    "America/New_York",
    "Australia/Sydney",
    "Asia/Kolkata",
    "Pacific/Chatham",
];

fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    // 2020-01-01 .. 2035-01-01
    (1_577_836_800i64..2_051_222_400i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn zone() -> impl Strategy<Value = Tz> {
    prop::sample::select(ZONES).prop_map(|name| name.parse::<Tz>().unwrap())
}

fn time_of_day() -> impl Strategy<Value = NaiveTime> {
    (0u32..24, 0u32..60).prop_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0).unwrap())
}

proptest! {
    #[test]
    fn prop_daily_next_is_strictly_later_and_within_a_day(after in instant(), tz in zone(), time in time_of_day()) {
        let next = Cycle::Daily { time }.next_after(after, tz).unwrap();
        prop_assert!(next > after);
        prop_assert!(next - after <= chrono::TimeDelta::hours(26));
    }

    #[test]
    fn prop_weekly_lands_on_weekday(after in instant(), tz in zone(), time in time_of_day(), day in 0u8..7) {
        let weekday = Weekday::try_from(day).unwrap();
        let next = Cycle::Weekly { weekday, time }.next_after(after, tz).unwrap();
        prop_assert!(next > after);
        prop_assert!(next - after <= chrono::TimeDelta::days(8));
        // A gap time may shift the wall clock but never the date
        prop_assert_eq!(next.with_timezone(&tz).weekday(), weekday);
    }

    #[test]
    fn prop_monthly_day_is_clamped(after in instant(), tz in zone(), time in time_of_day(), day in 1u32..=31) {
        let next = Cycle::Monthly { day, time }.next_after(after, tz).unwrap();
        prop_assert!(next > after);

        let local = next.with_timezone(&tz);
        let last = days_in_month(local.year(), local.month());
        prop_assert!(local.day() <= last);
        prop_assert_eq!(local.day(), day.min(last));
    }

    #[test]
    fn prop_cron_step_minutes(after in instant(), tz in zone(), step in 1u32..30) {
        let expr = CronExpr::parse(&format!("*/{} * * * *", step)).unwrap();
        let next = expr.next_after(after, tz).unwrap();
        prop_assert!(next > after);
        prop_assert_eq!(next.with_timezone(&tz).minute() % step, 0);
        prop_assert_eq!(next.second(), 0);
    }

    #[test]
    fn prop_cycle_serde_keeps_next_run(after in instant(), tz in zone(), time in time_of_day(), day in 1u32..=28, month in 1u32..=12) {
        let cycle = Cycle::Yearly { month, day, time };
        let json = serde_json::to_string(&cycle).unwrap();
        let back: Cycle = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.next_after(after, tz), cycle.next_after(after, tz));
    }
}
