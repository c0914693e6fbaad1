//! Five-field cron trigger (`minute hour day-of-month month day-of-week`).
//!
//! Every field accepts `*`, a single value, an inclusive range `a-b`, a step
//! `*/n` (matches values divisible by `n`) and comma separated lists of those.
//! Day-of-week counts from Sunday = 0; `7` is accepted as Sunday as well.
//! A time matches when all five fields match. Times are evaluated in UTC.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

use crate::TaskloomError;

/// How far ahead `next_run` searches before giving up. Wide enough for
/// leap-day/weekday combinations, which repeat at most every 28 years.
const SEARCH_HORIZON_DAYS: i64 = 366 * 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldPart {
    Any,
    Value(u32),
    Range(u32, u32),
    Step(u32),
}

impl FieldPart {
    fn matches(self, value: u32) -> bool {
        match self {
            FieldPart::Any => true,
            FieldPart::Value(v) => v == value,
            FieldPart::Range(lo, hi) => (lo..=hi).contains(&value),
            FieldPart::Step(n) => value % n == 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day_of_month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day_of_week", min: 0, max: 7 };

/// One parsed cron field, keeping its source text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    source: String,
    parts: Vec<FieldPart>,
}

impl CronField {
    fn parse(spec: FieldSpec, source: &str) -> Result<Self, TaskloomError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(invalid(spec, source, "empty field"));
        }

        let parts = source
            .split(',')
            .map(|item| parse_part(spec, source, item.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    fn matches(&self, value: u32) -> bool {
        self.parts.iter().any(|part| part.matches(value))
    }
}

fn invalid(spec: FieldSpec, source: &str, reason: &str) -> TaskloomError {
    TaskloomError::InvalidCron(format!("{} field '{}': {}", spec.name, source, reason))
}

fn parse_part(spec: FieldSpec, source: &str, item: &str) -> Result<FieldPart, TaskloomError> {
    let number = |text: &str| -> Result<u32, TaskloomError> {
        let value: u32 = text
            .parse()
            .map_err(|_| invalid(spec, source, &format!("'{text}' is not a number")))?;
        if value < spec.min || value > spec.max {
            return Err(invalid(
                spec,
                source,
                &format!("{value} is outside {}-{}", spec.min, spec.max),
            ));
        }
        Ok(value)
    };

    if item == "*" {
        return Ok(FieldPart::Any);
    }
    if let Some(step) = item.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| invalid(spec, source, &format!("'{step}' is not a step")))?;
        if n == 0 {
            return Err(invalid(spec, source, "step must be positive"));
        }
        return Ok(FieldPart::Step(n));
    }
    if let Some((lo, hi)) = item.split_once('-') {
        let (lo, hi) = (number(lo)?, number(hi)?);
        if lo > hi {
            return Err(invalid(spec, source, &format!("range {lo}-{hi} is reversed")));
        }
        return Ok(FieldPart::Range(lo, hi));
    }
    Ok(FieldPart::Value(number(item)?))
}

/// Fires whenever the wall clock (UTC, minute resolution) matches all five
/// fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronTrigger {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl Default for CronTrigger {
    /// Every minute.
    fn default() -> Self {
        let any = || CronField {
            source: "*".to_string(),
            parts: vec![FieldPart::Any],
        };
        Self {
            minute: any(),
            hour: any(),
            day_of_month: any(),
            month: any(),
            day_of_week: any(),
        }
    }
}

impl CronTrigger {
    pub fn new(
        minute: &str,
        hour: &str,
        day_of_month: &str,
        month: &str,
        day_of_week: &str,
    ) -> Result<Self, TaskloomError> {
        Ok(Self {
            minute: CronField::parse(MINUTE, minute)?,
            hour: CronField::parse(HOUR, hour)?,
            day_of_month: CronField::parse(DAY_OF_MONTH, day_of_month)?,
            month: CronField::parse(MONTH, month)?,
            day_of_week: CronField::parse(DAY_OF_WEEK, day_of_week)?,
        })
    }

    /// Parse `"m h dom mon dow"`. Exactly five whitespace separated fields.
    pub fn from_expression(expression: &str) -> Result<Self, TaskloomError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        match fields.as_slice() {
            [minute, hour, dom, month, dow] => Self::new(minute, hour, dom, month, dow),
            _ => Err(TaskloomError::InvalidCron(format!(
                "expected 5 fields, got {} in '{}'",
                fields.len(),
                expression
            ))),
        }
    }

    pub fn with_minute(mut self, expr: &str) -> Result<Self, TaskloomError> {
        self.minute = CronField::parse(MINUTE, expr)?;
        Ok(self)
    }

    pub fn with_hour(mut self, expr: &str) -> Result<Self, TaskloomError> {
        self.hour = CronField::parse(HOUR, expr)?;
        Ok(self)
    }

    pub fn with_day_of_month(mut self, expr: &str) -> Result<Self, TaskloomError> {
        self.day_of_month = CronField::parse(DAY_OF_MONTH, expr)?;
        Ok(self)
    }

    pub fn with_month(mut self, expr: &str) -> Result<Self, TaskloomError> {
        self.month = CronField::parse(MONTH, expr)?;
        Ok(self)
    }

    pub fn with_day_of_week(mut self, expr: &str) -> Result<Self, TaskloomError> {
        self.day_of_week = CronField::parse(DAY_OF_WEEK, expr)?;
        Ok(self)
    }

    pub fn minute(&self) -> &str {
        &self.minute.source
    }

    pub fn hour(&self) -> &str {
        &self.hour.source
    }

    pub fn day_of_month(&self) -> &str {
        &self.day_of_month.source
    }

    pub fn month(&self) -> &str {
        &self.month.source
    }

    pub fn day_of_week(&self) -> &str {
        &self.day_of_week.source
    }

    pub fn expression(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute(),
            self.hour(),
            self.day_of_month(),
            self.month(),
            self.day_of_week()
        )
    }

    fn weekday_matches(&self, sunday_based: u32) -> bool {
        self.day_of_week.matches(sunday_based)
            || (sunday_based == 0 && self.day_of_week.matches(7))
    }

    /// Whether `time` (truncated to the minute) satisfies every field.
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        self.month.matches(time.month())
            && self.day_of_month.matches(time.day())
            && self.weekday_matches(time.weekday().num_days_from_sunday())
            && self.hour.matches(time.hour())
            && self.minute.matches(time.minute())
    }

    /// First matching minute strictly after `from`, or `None` if nothing
    /// matches within the search horizon (for example February 30th).
    pub fn next_run(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = from
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        let horizon = from
            .checked_add_signed(Duration::days(SEARCH_HORIZON_DAYS))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        while candidate <= horizon {
            if !self.month.matches(candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_of_month.matches(candidate.day())
                || !self.weekday_matches(candidate.weekday().num_days_from_sunday())
            {
                candidate = start_of_next_day(candidate)?;
                continue;
            }
            if !self.hour.matches(candidate.hour()) {
                candidate = candidate
                    .with_minute(0)?
                    .checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !self.minute.matches(candidate.minute()) {
                candidate = candidate.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(candidate);
        }

        None
    }
}

fn start_of_next_day(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = time.date_naive().succ_opt()?;
    Some(next.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if time.month() == 12 {
        (time.year() + 1, 1)
    } else {
        (time.year(), time.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}

impl fmt::Display for CronTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression())
    }
}
