//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field `*`, a number, a
//! range, a step (`*/5`, `10-40/10`), or a comma list. Day-of-month and
//! day-of-week combine the standard way: when both are restricted, either
//! matching fires the schedule. Sunday is 0 (7 accepted as an alias).

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    /// `*` (or `*/1`)
    Any,
    /// Explicit set of allowed values
    Set(BTreeSet<u32>),
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Set(values) => values.contains(&value),
        }
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

fn parse_field(raw: &str, min: u32, max: u32, expression: &str) -> Result<Field> {
    let bad = |message: String| Error::BadSchedule {
        expression: expression.to_string(),
        message,
    };

    if raw == "*" {
        return Ok(Field::Any);
    }

    let mut values = BTreeSet::new();
    for piece in raw.split(',') {
        let (range_part, step) = match piece.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| bad(format!("invalid step '{}'", step)))?;
                if step == 0 {
                    return Err(bad("step of 0".into()));
                }
                (range, step)
            }
            None => (piece, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| bad(format!("invalid value '{}'", lo)))?;
            let hi: u32 = hi.parse().map_err(|_| bad(format!("invalid value '{}'", hi)))?;
            (lo, hi)
        } else {
            let value: u32 = range_part
                .parse()
                .map_err(|_| bad(format!("invalid value '{}'", range_part)))?;
            (value, value)
        };

        if lo > hi {
            return Err(bad(format!("range {}-{} is inverted", lo, hi)));
        }
        for value in (lo..=hi).step_by(step as usize) {
            // Day-of-week 7 is Sunday, same as 0.
            let normalized = if max == 6 && value == 7 { 0 } else { value };
            if normalized < min || normalized > max {
                return Err(bad(format!("value {} out of range {}-{}", value, min, max)));
            }
            values.insert(normalized);
        }
    }
    if values.is_empty() {
        return Err(bad("empty field".into()));
    }
    Ok(Field::Set(values))
}

impl CronSchedule {
    /// Parse a 5-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::BadSchedule {
                expression: expression.to_string(),
                message: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, expression)?,
            hour: parse_field(fields[1], 0, 23, expression)?,
            day_of_month: parse_field(fields[2], 1, 31, expression)?,
            month: parse_field(fields[3], 1, 12, expression)?,
            day_of_week: parse_field(fields[4], 0, 6, expression)?,
        })
    }

    fn day_matches(&self, date: DateTime<Utc>) -> bool {
        if !self.month.matches(date.month()) {
            return false;
        }
        let dom = self.day_of_month.matches(date.day());
        let dow = self.day_of_week.matches(date.weekday().num_days_from_sunday());
        match (&self.day_of_month, &self.day_of_week) {
            // Both restricted: either may fire (classic cron OR).
            (Field::Set(_), Field::Set(_)) => dom || dow,
            _ => dom && dow,
        }
    }

    /// The first fire time strictly after `after`. `None` when no time in
    /// the next four years matches (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut day = Utc
            .with_ymd_and_hms(after.year(), after.month(), after.day(), 0, 0, 0)
            .single()?;
        let first_candidate = after + ChronoDuration::minutes(1);
        let horizon = after + ChronoDuration::days(366 * 4);

        while day <= horizon {
            if self.day_matches(day) {
                let from = if day.date_naive() == first_candidate.date_naive() {
                    first_candidate
                } else if day > first_candidate {
                    day
                } else {
                    day + ChronoDuration::days(1) // day already behind; skip
                };
                if from.date_naive() == day.date_naive() {
                    if let Some(at) = self.first_in_day(day, from) {
                        return Some(at);
                    }
                }
            }
            day += ChronoDuration::days(1);
        }
        None
    }

    fn first_in_day(&self, day: DateTime<Utc>, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        for hour in 0..24u32 {
            if !self.hour.matches(hour) {
                continue;
            }
            for minute in 0..60u32 {
                if !self.minute.matches(minute) {
                    continue;
                }
                let candidate = day + ChronoDuration::hours(hour as i64) + ChronoDuration::minutes(minute as i64);
                if candidate >= from {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 12, 30)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 12, 31));
    }

    #[test]
    fn test_step_minutes() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2026, 3, 10, 12, 0)).unwrap(),
            at(2026, 3, 10, 12, 15)
        );
        assert_eq!(
            schedule.next_after(at(2026, 3, 10, 12, 50)).unwrap(),
            at(2026, 3, 10, 13, 0)
        );
    }

    #[test]
    fn test_daily_at_fixed_time() {
        let schedule = CronSchedule::parse("30 4 * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2026, 3, 10, 5, 0)).unwrap(),
            at(2026, 3, 11, 4, 30)
        );
        assert_eq!(
            schedule.next_after(at(2026, 3, 10, 3, 0)).unwrap(),
            at(2026, 3, 10, 4, 30)
        );
    }

    #[test]
    fn test_weekday_restriction() {
        // 2026-03-14 is a Saturday; next weekday 9:00 is Monday the 16th.
        let schedule = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(
            schedule.next_after(at(2026, 3, 13, 10, 0)).unwrap(),
            at(2026, 3, 16, 9, 0)
        );
    }

    #[test]
    fn test_dom_dow_or_semantics() {
        // Day 15 or any Sunday.
        let schedule = CronSchedule::parse("0 0 15 * 0").unwrap();
        // 2026-03-10 is a Tuesday; the next Sunday (the 15th happens to
        // match both) is 2026-03-15.
        assert_eq!(
            schedule.next_after(at(2026, 3, 10, 0, 0)).unwrap(),
            at(2026, 3, 15, 0, 0)
        );
        // After the 15th, the next fire is Sunday the 22nd, before April 15.
        assert_eq!(
            schedule.next_after(at(2026, 3, 15, 0, 0)).unwrap(),
            at(2026, 3, 22, 0, 0)
        );
    }

    #[test]
    fn test_yearly() {
        let schedule = CronSchedule::parse("0 0 1 1 *").unwrap();
        assert_eq!(
            schedule.next_after(at(2026, 6, 1, 0, 0)).unwrap(),
            at(2027, 1, 1, 0, 0)
        );
    }

    #[test]
    fn test_sunday_alias() {
        assert_eq!(
            CronSchedule::parse("0 0 * * 7").unwrap(),
            CronSchedule::parse("0 0 * * 0").unwrap()
        );
    }

    #[test]
    fn test_parse_failures() {
        for bad in ["", "* * * *", "60 * * * *", "* 24 * * *", "a * * * *", "*/0 * * * *", "5-2 * * * *"] {
            assert!(CronSchedule::parse(bad).is_err(), "should reject '{}'", bad);
        }
    }

    #[test]
    fn test_impossible_date_returns_none() {
        let schedule = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert!(schedule.next_after(at(2026, 1, 1, 0, 0)).is_none());
    }
}
