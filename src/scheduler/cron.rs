//! Cron expression validation and next-run computation.
//!
//! Operators write the standard five-field form (`min hour dom month dow`).
//! The evaluator wants a leading seconds field and numbers weekdays 1-7 from
//! Sunday, so five-field input is normalised before parsing. Six and seven
//! field expressions are passed through untouched.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use super::error::SchedulerError;

/// A validated cron schedule, evaluated in UTC.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Validate and parse `expr`.
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidCronExpression {
            expr: expr.to_string(),
            reason,
        };

        let normalized = normalize(expr).map_err(invalid)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expression: expr.trim().to_string(),
            schedule,
        })
    }

    /// The expression as the operator wrote it.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Firings in `(from, until]`, at most `limit` of them.
    pub fn upcoming(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from)
            .take_while(|at| *at <= until)
            .take(limit)
            .collect()
    }
}

/// Rewrite `expr` into the seconds-first form the evaluator accepts.
fn normalize(expr: &str) -> Result<String, String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err("expression is empty".to_string());
    }

    if let Some(descriptor) = trimmed.strip_prefix('@') {
        return match descriptor.to_ascii_lowercase().as_str() {
            "yearly" | "annually" => Ok("0 0 0 1 1 *".to_string()),
            "monthly" => Ok("0 0 0 1 * *".to_string()),
            "weekly" => Ok("0 0 0 * * Sun".to_string()),
            "daily" | "midnight" => Ok("0 0 0 * * *".to_string()),
            "hourly" => Ok("0 0 * * * *".to_string()),
            other => Err(format!("unsupported descriptor '@{other}'")),
        };
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_day_of_week(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5, 6 or 7 fields, found {n}")),
    }
}

/// Map standard weekday numbers (0-7, Sunday = 0 or 7) onto 1-7 (Sunday = 1).
///
/// Numeric ranges and steps are expanded into an explicit day list first, so
/// `0-7/2` keeps its standard meaning of Sunday, Tuesday, Thursday, Saturday.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let field = field.trim();
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    let mut named = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step)?)),
            None => (part, None),
        };

        let bounds = match range.split_once('-') {
            Some((lo, hi)) => match (weekday_number(lo)?, weekday_number(hi)?) {
                (Some(lo), Some(hi)) if lo <= hi => Some((lo, hi)),
                (Some(lo), Some(hi)) => {
                    return Err(format!("day-of-week range {lo}-{hi} runs backwards"))
                }
                (None, None) => None,
                _ => return Err(format!("day-of-week range '{range}' mixes names and numbers")),
            },
            None if range.trim() == "*" => Some((0, 7)),
            None => weekday_number(range)?.map(|n| match step {
                // "n/step" runs from n to the end of the week
                Some(_) => (n, 7),
                None => (n, n),
            }),
        };

        match bounds {
            Some((lo, hi)) => {
                let step = step.unwrap_or(1);
                days.extend((lo..=hi).step_by(step).map(|n| n % 7 + 1));
            }
            // Day names need no translation
            None => named.push(part.trim().to_string()),
        }
    }

    let mut parts: Vec<String> = days.into_iter().map(|d| d.to_string()).collect();
    parts.extend(named);
    Ok(parts.join(","))
}

/// Parse one weekday token. `None` for a day name.
fn weekday_number(token: &str) -> Result<Option<u8>, String> {
    let token = token.trim();
    if token.is_empty() {
        return Err("empty day-of-week value".to_string());
    }
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    match token.parse::<u8>() {
        Ok(n @ 0..=7) => Ok(Some(n)),
        _ => Err(format!("day-of-week value {token} out of range 0-7")),
    }
}

fn parse_step(step: &str) -> Result<usize, String> {
    match step.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("invalid day-of-week step '{step}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_nightly_fires_at_next_midnight() {
        let schedule = CronSchedule::parse("0 0 * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 15, 30)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 0, 0));
    }

    #[test]
    fn test_every_five_minutes() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 15, 31)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 15, 35));
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        // 2026-03-10 is a Tuesday
        for expr in ["0 4 * * 0", "0 4 * * 7", "0 4 * * Sun"] {
            let schedule = CronSchedule::parse(expr).unwrap();
            let next = schedule.next_after(at(2026, 3, 10, 12, 0)).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{expr}");
            assert_eq!(next.hour(), 4);
        }
    }

    #[test]
    fn test_weekday_range() {
        // Monday-Friday at 09:00, starting from Saturday
        let schedule = CronSchedule::parse("0 9 * * 1-5").unwrap();
        let next = schedule.next_after(at(2026, 3, 14, 12, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_range_ending_on_sunday() {
        let schedule = CronSchedule::parse("0 9 * * 5-7").unwrap();
        let days: Vec<Weekday> = schedule
            .upcoming(at(2026, 3, 9, 0, 0), at(2026, 3, 16, 0, 0), 100)
            .iter()
            .map(|d| d.weekday())
            .collect();
        assert_eq!(days, vec![Weekday::Fri, Weekday::Sat, Weekday::Sun]);
    }

    fn weekdays(expr: &str) -> Vec<Weekday> {
        // 2026-03-09 is a Monday; one full week
        CronSchedule::parse(expr)
            .unwrap()
            .upcoming(at(2026, 3, 9, 0, 0), at(2026, 3, 16, 0, 0), 100)
            .iter()
            .map(|d| d.weekday())
            .collect()
    }

    #[test]
    fn test_stepped_ranges_through_sunday() {
        use Weekday::*;
        assert_eq!(weekdays("0 9 * * 0-7/2"), vec![Tue, Thu, Sat, Sun]);
        assert_eq!(weekdays("0 9 * * 1-7/2"), vec![Mon, Wed, Fri, Sun]);
        assert_eq!(weekdays("0 9 * * */3"), vec![Wed, Sat, Sun]);
        assert_eq!(weekdays("0 9 * * 1,3/2"), vec![Mon, Wed, Fri, Sun]);
        assert_eq!(weekdays("0 9 * * Mon-Wed"), vec![Mon, Tue, Wed]);
    }

    #[test]
    fn test_malformed_weekday_fields_rejected() {
        for expr in ["0 9 * * 5-2", "0 9 * * 1-7/0", "0 9 * * Mon-5", "0 9 * * 1,,2"] {
            assert!(CronSchedule::parse(expr).is_err(), "{expr:?}");
        }
    }

    #[test]
    fn test_seconds_field_passes_through() {
        let schedule = CronSchedule::parse("*/10 * * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 1).unwrap();
        let next = schedule.next_after(base).unwrap();
        assert_eq!(next.second(), 10);
    }

    #[test]
    fn test_descriptors() {
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(
            daily.next_after(at(2026, 3, 10, 15, 30)),
            Some(at(2026, 3, 11, 0, 0))
        );
        let hourly = CronSchedule::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(at(2026, 3, 10, 15, 30)),
            Some(at(2026, 3, 10, 16, 0))
        );
        assert!(CronSchedule::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_invalid_expressions_rejected() {
        for expr in [
            "",
            "not a cron",
            "* * *",
            "61 * * * *",
            "0 25 * * *",
            "0 0 * * 9",
            "0 0 32 * *",
        ] {
            let err = CronSchedule::parse(expr).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidCronExpression { .. }),
                "{expr:?} should be invalid"
            );
        }
    }

    #[test]
    fn test_upcoming_window() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let runs = schedule.upcoming(at(2026, 3, 10, 0, 30), at(2026, 3, 10, 3, 30), 100);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], at(2026, 3, 10, 1, 0));

        let capped = schedule.upcoming(at(2026, 3, 10, 0, 30), at(2026, 3, 10, 3, 30), 2);
        assert_eq!(capped, runs[..2].to_vec());
    }

    #[test]
    fn test_expression_preserved() {
        let schedule = CronSchedule::parse("  0 0 * * *  ").unwrap();
        assert_eq!(schedule.expression(), "0 0 * * *");
    }
}
