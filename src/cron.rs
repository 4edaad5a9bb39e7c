//! Six-field cron expression evaluator.
//! Fields: "SEC MIN HOUR DOM MON DOW" (seconds first, no year extension).
//! Each field accepts `*`, a literal, a range `a-b`, a step `*/n` or `a-b/n`,
//! and comma-separated lists of those. Day-of-week is 0-6 with 0 = Sunday.
//!
//! Day-of-month and day-of-week follow standard cron semantics: when both are
//! restricted a day matches if either matches; when one is `*` the other
//! governs alone.

use chrono::{DateTime, Datelike, Days, Duration, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days: Vec<u32>,
    months: Vec<u32>,
    weekdays: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a six-field cron expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(SchedulerError::Validation(format!(
                "cron expression '{expr}' must have 6 fields (sec min hour dom mon dow), got {}",
                fields.len()
            )));
        }

        let (seconds, _) = parse_field(fields[0], 0, 59, "seconds")?;
        let (minutes, _) = parse_field(fields[1], 0, 59, "minutes")?;
        let (hours, _) = parse_field(fields[2], 0, 23, "hours")?;
        let (days, dom_restricted) = parse_field(fields[3], 1, 31, "day-of-month")?;
        let (months, _) = parse_field(fields[4], 1, 12, "month")?;
        let (weekdays, dow_restricted) = parse_field(fields[5], 0, 6, "day-of-week")?;

        Ok(Self {
            expr: expr.to_string(),
            seconds,
            minutes,
            hours,
            days,
            months,
            weekdays,
            dom_restricted,
            dow_restricted,
        })
    }

    /// Check an expression without surfacing the parse error. Never panics.
    pub fn validate(expr: &str) -> bool {
        Self::parse(expr).is_ok()
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Smallest instant strictly greater than `from` satisfying all fields.
    ///
    /// Returns `None` when no matching instant exists within four years
    /// (e.g. a schedule pinned to Feb 30).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (from + Duration::seconds(1)).with_nanosecond(0)?;
        let limit = from + Duration::days(4 * 366);

        while t <= limit {
            if !self.months.contains(&t.month()) {
                t = next_month_start(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = next_day_start(t)?;
                continue;
            }
            let hour = t.hour();
            if !self.hours.contains(&hour) {
                match self.hours.iter().find(|&&h| h > hour) {
                    Some(&next) => {
                        t = t.with_hour(next)?.with_minute(0)?.with_second(0)?;
                    }
                    None => t = next_day_start(t)?,
                }
                continue;
            }
            let minute = t.minute();
            if !self.minutes.contains(&minute) {
                match self.minutes.iter().find(|&&m| m > minute) {
                    Some(&next) => {
                        t = t.with_minute(next)?.with_second(0)?;
                    }
                    None => t = (t + Duration::hours(1)).with_minute(0)?.with_second(0)?,
                }
                continue;
            }
            let second = t.second();
            if !self.seconds.contains(&second) {
                match self.seconds.iter().find(|&&s| s > second) {
                    Some(&next) => t = t.with_second(next)?,
                    None => t = (t + Duration::minutes(1)).with_second(0)?,
                }
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days.contains(&t.day());
        let dow = self.weekdays.contains(&t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

/// First second of the month after `t`.
fn next_month_start(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Midnight of the day after `t`.
fn next_day_start(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().checked_add_days(Days::new(1))?;
    Some(Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?))
}

/// Parse a single cron field into a sorted list of matching values plus a flag
/// telling whether the field restricts anything (`*` alone does not).
fn parse_field(field: &str, min: u32, max: u32, name: &str) -> Result<(Vec<u32>, bool)> {
    if field == "*" {
        return Ok(((min..=max).collect(), false));
    }

    let invalid = |detail: String| SchedulerError::Validation(format!("{name} field: {detail}"));
    let mut values = std::collections::BTreeSet::new();

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step in '{part}'")))?;
                if step == 0 {
                    return Err(invalid(format!("zero step in '{part}'")));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| invalid(format!("bad range start in '{part}'")))?;
            let b: u32 = b
                .parse()
                .map_err(|_| invalid(format!("bad range end in '{part}'")))?;
            (a, b)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| invalid(format!("bad value '{part}'")))?;
            // vixie semantics: "a/n" means a through max stepped by n
            if step > 1 { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(format!(
                "'{part}' out of range {min}-{max} or inverted"
            )));
        }
        values.extend((lo..=hi).step_by(step as usize));
    }

    Ok((values.into_iter().collect(), true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_second() {
        let cron = CronSchedule::parse("* * * * * *").unwrap();
        let from = at(2026, 2, 22, 10, 30, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 22, 10, 30, 1));
    }

    #[test]
    fn test_strictly_greater() {
        let cron = CronSchedule::parse("0 0 8 * * *").unwrap();
        let from = at(2026, 2, 22, 8, 0, 0);
        // Already exactly at a fire time — next must be tomorrow, not now.
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 23, 8, 0, 0));
    }

    #[test]
    fn test_specific_time() {
        let cron = CronSchedule::parse("0 30 9 * * *").unwrap();
        let from = at(2026, 2, 22, 7, 0, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 22, 9, 30, 0));
    }

    #[test]
    fn test_step_every_two_seconds() {
        let cron = CronSchedule::parse("*/2 * * * * *").unwrap();
        let from = at(2026, 2, 22, 10, 0, 1);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 22, 10, 0, 2));
        let from = at(2026, 2, 22, 10, 0, 58);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 22, 10, 1, 0));
    }

    #[test]
    fn test_range_and_list() {
        let cron = CronSchedule::parse("0 0 9-17 * * *").unwrap();
        let from = at(2026, 2, 22, 17, 30, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 23, 9, 0, 0));

        let cron = CronSchedule::parse("0 0,15,30,45 * * * *").unwrap();
        let from = at(2026, 2, 22, 10, 16, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 22, 10, 30, 0));
    }

    #[test]
    fn test_range_with_step() {
        let cron = CronSchedule::parse("0 10-50/20 * * * *").unwrap();
        let from = at(2026, 2, 22, 10, 31, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 22, 10, 50, 0));
    }

    #[test]
    fn test_month_rollover() {
        let cron = CronSchedule::parse("0 0 0 1 * *").unwrap();
        let from = at(2026, 1, 15, 12, 0, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 1, 0, 0, 0));
    }

    #[test]
    fn test_leap_year() {
        let cron = CronSchedule::parse("0 0 0 29 2 *").unwrap();
        let from = at(2026, 1, 1, 0, 0, 0);
        // 2028 is the next leap year after 2026.
        assert_eq!(cron.next_after(from).unwrap(), at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn test_impossible_date() {
        let cron = CronSchedule::parse("0 0 0 30 2 *").unwrap();
        assert!(cron.next_after(at(2026, 1, 1, 0, 0, 0)).is_none());
    }

    #[test]
    fn test_dom_dow_or_semantics() {
        // Both restricted: the 15th OR a Sunday, whichever comes first.
        let cron = CronSchedule::parse("0 0 0 15 * 0").unwrap();
        // 2026-02-22 is a Sunday; from the 16th the next match is Sunday the 22nd.
        let from = at(2026, 2, 16, 0, 0, 0);
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 22, 0, 0, 0));

        // Only dow restricted: dom `*` must not force day matching.
        let cron = CronSchedule::parse("0 0 0 * * 1").unwrap();
        let from = at(2026, 2, 22, 0, 0, 0); // Sunday
        assert_eq!(cron.next_after(from).unwrap(), at(2026, 2, 23, 0, 0, 0));
    }

    #[test]
    fn test_validate() {
        assert!(CronSchedule::validate("0 0 8 * * *"));
        assert!(CronSchedule::validate("*/5 * * * * *"));
        assert!(!CronSchedule::validate("0 8 * * *")); // five fields
        assert!(!CronSchedule::validate("bad"));
        assert!(!CronSchedule::validate("60 * * * * *")); // out of range
        assert!(!CronSchedule::validate("0 * * * * 7")); // dow is 0-6
        assert!(!CronSchedule::validate("*/0 * * * * *")); // zero step
        assert!(!CronSchedule::validate("0 30-10 * * * *")); // inverted range
    }

    #[test]
    fn test_parse_errors_are_validation() {
        match CronSchedule::parse("0 0 25 * * *") {
            Err(SchedulerError::Validation(_)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
