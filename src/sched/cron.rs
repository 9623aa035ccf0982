//! # 5-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, with `*`, lists, ranges,
//! and `*/N` / `A-B/N` stepping. Day-of-month and day-of-week combine with
//! **OR** when both are restricted, matching the standard convention.
//! Day-of-week accepts 0–7 with both 0 and 7 meaning Sunday. Evaluation is
//! in UTC.
//!
//! ```
//! use craftvisor::sched::CronExpr;
//! use chrono::{TimeZone, Utc};
//!
//! let every_five = CronExpr::parse("*/5 * * * *").unwrap();
//! let after = Utc.with_ymd_and_hms(2024, 3, 1, 12, 2, 30).unwrap();
//! let next = every_five.next_after(after).unwrap();
//! assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap());
//! ```

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

/// How many days ahead `next_after` scans before giving up. Covers leap
/// years, so only impossible dates (e.g. Feb 30) come back empty.
const SCAN_DAYS: u64 = 4 * 366;

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parses an expression, rejecting anything but exactly five fields.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::validation(
                "cron",
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59)?;
        let (hours, _) = parse_field(fields[1], 0, 23)?;
        let (days_of_month, dom_wild) = parse_field(fields[2], 1, 31)?;
        let (months, _) = parse_field(fields[3], 1, 12)?;
        let (mut days_of_week, dow_wild) = parse_field(fields[4], 0, 7)?;

        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !dom_wild,
            dow_restricted: !dow_wild,
        })
    }

    /// First fire time strictly after `after`, or `None` when the expression
    /// can never match (impossible date combinations).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (after + chrono::Duration::seconds(60 - i64::from(after.second())))
            .with_nanosecond(0)?
            .with_second(0)?;
        let start_date = start.date_naive();

        for day_offset in 0..SCAN_DAYS {
            let date = start_date.checked_add_days(Days::new(day_offset))?;
            if !self.day_matches(date) {
                continue;
            }

            let first_day = day_offset == 0;
            let hour_from = if first_day { start.hour() } else { 0 };
            for hour in hour_from..24 {
                if self.hours & (1 << hour) == 0 {
                    continue;
                }
                let minute_from = if first_day && hour == start.hour() {
                    start.minute()
                } else {
                    0
                };
                for minute in minute_from..60 {
                    if self.minutes & (1 << minute) != 0 {
                        return Utc
                            .with_ymd_and_hms(
                                date.year(),
                                date.month(),
                                date.day(),
                                hour,
                                minute,
                                0,
                            )
                            .single();
                    }
                }
            }
        }
        None
    }

    /// Month plus the standard OR rule for day-of-month / day-of-week.
    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom_hit = self.days_of_month & (1 << date.day()) != 0;
        // Sunday == 0 in cron.
        let dow_hit = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }
}

/// Parses one field into a bitmask. Returns `(mask, is_wildcard)`.
fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool)> {
    if field == "*" {
        return Ok((range_mask(min, max, 1), true));
    }

    let mut mask: u64 = 0;
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| bad_field(field))?;
                (base, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((lo, hi)) = base.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| bad_field(field))?;
            let hi: u32 = hi.parse().map_err(|_| bad_field(field))?;
            if lo > hi {
                return Err(bad_field(field));
            }
            (lo, hi)
        } else {
            let value: u32 = base.parse().map_err(|_| bad_field(field))?;
            // A bare value with a step ("3/5") is not standard.
            if step != 1 {
                return Err(bad_field(field));
            }
            (value, value)
        };

        if lo < min || hi > max {
            return Err(Error::validation(
                "cron",
                format!("value out of range in '{field}' (allowed {min}-{max})"),
            ));
        }
        mask |= range_mask(lo, hi, step);
    }

    if mask == 0 {
        return Err(bad_field(field));
    }
    Ok((mask, false))
}

fn range_mask(lo: u32, hi: u32, step: u32) -> u64 {
    let mut mask = 0u64;
    let mut value = lo;
    while value <= hi {
        mask |= 1 << value;
        value += step;
    }
    mask
}

fn bad_field(field: &str) -> Error {
    Error::validation("cron", format!("invalid field '{field}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn rejects_wrong_arity_and_garbage() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
        assert!(CronExpr::parse("sixty * * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * 8").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
    }

    #[test]
    fn every_minute_is_strictly_after() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        let next = cron.next_after(at(2024, 3, 1, 12, 30, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 1, 12, 31, 0));

        // Mid-minute rounds up to the next whole minute.
        let next = cron.next_after(at(2024, 3, 1, 12, 30, 45)).unwrap();
        assert_eq!(next, at(2024, 3, 1, 12, 31, 0));
    }

    #[test]
    fn stepping_and_daily_fire() {
        let cron = CronExpr::parse("*/5 * * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 12, 2, 0)).unwrap(),
            at(2024, 3, 1, 12, 5, 0)
        );
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 12, 55, 0)).unwrap(),
            at(2024, 3, 1, 13, 0, 0)
        );

        let daily = CronExpr::parse("0 4 * * *").unwrap();
        assert_eq!(
            daily.next_after(at(2024, 3, 1, 4, 0, 0)).unwrap(),
            at(2024, 3, 2, 4, 0, 0),
            "a fire exactly at the probe time must move to the next day"
        );
        assert_eq!(
            daily.next_after(at(2024, 3, 1, 3, 59, 0)).unwrap(),
            at(2024, 3, 1, 4, 0, 0)
        );
    }

    #[test]
    fn lists_and_ranges() {
        let cron = CronExpr::parse("0 9-17 * * 1-5").unwrap();
        // Friday evening rolls over to Monday morning.
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 18, 0, 0)).unwrap(), // Fri
            at(2024, 3, 4, 9, 0, 0)                              // Mon
        );

        let cron = CronExpr::parse("0,30 12 * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 12, 1, 0)).unwrap(),
            at(2024, 3, 1, 12, 30, 0)
        );
    }

    #[test]
    fn ranged_step() {
        let cron = CronExpr::parse("10-30/10 * * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 0, 0, 0)).unwrap(),
            at(2024, 3, 1, 0, 10, 0)
        );
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 0, 21, 0)).unwrap(),
            at(2024, 3, 1, 0, 30, 0)
        );
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 0, 31, 0)).unwrap(),
            at(2024, 3, 1, 1, 10, 0)
        );
    }

    #[test]
    fn dom_and_dow_combine_with_or() {
        // Fires on the 13th of the month OR on Fridays.
        let cron = CronExpr::parse("0 0 13 * 5").unwrap();
        // 2024-09-09 is a Monday; the next hit is Friday the 13th... of
        // September 2024, which happens to satisfy both.
        assert_eq!(
            cron.next_after(at(2024, 9, 9, 0, 0, 0)).unwrap(),
            at(2024, 9, 13, 0, 0, 0)
        );
        // 2024-09-14 (Sat): next Friday is the 20th, before the next 13th.
        assert_eq!(
            cron.next_after(at(2024, 9, 14, 0, 0, 0)).unwrap(),
            at(2024, 9, 20, 0, 0, 0)
        );
        // 2024-10-10 (Thu): the 11th is a Friday, beating October's 13th.
        assert_eq!(
            cron.next_after(at(2024, 10, 10, 0, 0, 0)).unwrap(),
            at(2024, 10, 11, 0, 0, 0)
        );
    }

    #[test]
    fn sunday_aliases() {
        let zero = CronExpr::parse("0 0 * * 0").unwrap();
        let seven = CronExpr::parse("0 0 * * 7").unwrap();
        assert_eq!(zero, seven);
        // 2024-03-03 is a Sunday.
        assert_eq!(
            zero.next_after(at(2024, 3, 1, 0, 0, 0)).unwrap(),
            at(2024, 3, 3, 0, 0, 0)
        );
    }

    #[test]
    fn impossible_dates_return_none() {
        let cron = CronExpr::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn leap_day_is_found() {
        let cron = CronExpr::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            cron.next_after(at(2023, 3, 1, 0, 0, 0)).unwrap(),
            at(2024, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn month_boundaries() {
        let cron = CronExpr::parse("0 0 1 * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 12, 31, 23, 59, 0)).unwrap(),
            at(2025, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn next_is_always_strictly_greater() {
        // Monotonicity across a sweep of probe points.
        let cron = CronExpr::parse("*/7 3,15 * * *").unwrap();
        let mut probe = at(2024, 1, 1, 0, 0, 0);
        for _ in 0..200 {
            let next = cron.next_after(probe).unwrap();
            assert!(next > probe);
            probe = next;
        }
    }
}
