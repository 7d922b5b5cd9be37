//! Schedule expression parsing and evaluation.
//!
//! Two forms are accepted:
//!
//! - standard 5-field cron expressions:
//!   ```text
//!   ┌───────────── minute (0-59)
//!   │ ┌───────────── hour (0-23)
//!   │ │ ┌───────────── day of month (1-31)
//!   │ │ │ ┌───────────── month (1-12)
//!   │ │ │ │ ┌───────────── day of week (0-6, 0 = Sunday)
//!   │ │ │ │ │
//!   * * * * *
//!   ```
//! - fixed intervals: `@every 4h`, `@every 1m30s`, plus the `@hourly`,
//!   `@daily`, `@weekly`, `@monthly` aliases.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing schedule expressions.
#[derive(Debug, Error)]
pub enum ScheduleParseError {
    #[error("Invalid cron expression: expected 5 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Value {value} is out of range [{min}, {max}] for {field}")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Invalid range: {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("Invalid step value: {0}")]
    InvalidStep(String),
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// A single field in a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronField {
    values: BTreeSet<u32>,
    min: u32,
    max: u32,
}

impl CronField {
    fn new(min: u32, max: u32) -> Self {
        Self {
            values: BTreeSet::new(),
            min,
            max,
        }
    }

    fn parse(&mut self, expr: &str) -> Result<(), ScheduleParseError> {
        for part in expr.split(',') {
            self.parse_part(part.trim())?;
        }
        Ok(())
    }

    fn parse_part(&mut self, part: &str) -> Result<(), ScheduleParseError> {
        // step values: */5, 0-30/5
        let (range_part, step) = if let Some(idx) = part.find('/') {
            let step_str = &part[idx + 1..];
            let step = step_str
                .parse::<u32>()
                .map_err(|_| ScheduleParseError::InvalidStep(step_str.to_string()))?;
            if step == 0 {
                return Err(ScheduleParseError::InvalidStep("0".to_string()));
            }
            (&part[..idx], Some(step))
        } else {
            (part, None)
        };

        let (start, end) = if range_part == "*" {
            (self.min, self.max)
        } else if let Some(idx) = range_part.find('-') {
            let start = range_part[..idx].parse::<u32>().map_err(|_| {
                ScheduleParseError::InvalidField {
                    field: range_part.to_string(),
                    reason: "invalid start of range".to_string(),
                }
            })?;
            let end = range_part[idx + 1..].parse::<u32>().map_err(|_| {
                ScheduleParseError::InvalidField {
                    field: range_part.to_string(),
                    reason: "invalid end of range".to_string(),
                }
            })?;
            if start > end {
                return Err(ScheduleParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = range_part.parse::<u32>().map_err(|_| {
                ScheduleParseError::InvalidField {
                    field: range_part.to_string(),
                    reason: "invalid value".to_string(),
                }
            })?;
            (value, value)
        };

        if start < self.min || end > self.max {
            return Err(ScheduleParseError::OutOfRange {
                field: range_part.to_string(),
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            self.values.insert(value);
            value += step;
        }

        Ok(())
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleParseError::InvalidFieldCount(parts.len()));
        }

        let mut minute = CronField::new(0, 59);
        let mut hour = CronField::new(0, 23);
        let mut day_of_month = CronField::new(1, 31);
        let mut month = CronField::new(1, 12);
        let mut day_of_week = CronField::new(0, 6);

        minute.parse(parts[0])?;
        hour.parse(parts[1])?;
        day_of_month.parse(parts[2])?;
        month.parse(parts[3])?;
        day_of_week.parse(parts[4])?;

        Ok(Self {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        })
    }

    /// Check if a datetime matches this cron expression.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }

    /// Calculate the next matching time strictly after `after`.
    pub fn next_run(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = (*after + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        // bounded search; four years covers leap-day expressions
        let max_iterations = 4 * 366 * 24 * 60;
        for _ in 0..max_iterations {
            if !self.month.matches(current.month()) {
                // skip to the start of the next month
                let (year, month) = if current.month() == 12 {
                    (current.year() + 1, 1)
                } else {
                    (current.year(), current.month() + 1)
                };
                current = chrono::NaiveDate::from_ymd_opt(year, month, 1)?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if self.matches(&current) {
                return Some(current);
            }
            current += chrono::Duration::minutes(1);
        }
        None
    }
}

/// A parsed backup schedule: cron-driven or a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Schedule {
    Cron { expr: String, cron: CronExpr },
    Every { expr: String, interval: Duration },
}

impl Schedule {
    /// Parse a schedule expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let trimmed = expr.trim();
        if let Some(interval_str) = trimmed.strip_prefix("@every ") {
            let interval = parse_interval(interval_str.trim())?;
            return Ok(Schedule::Every {
                expr: trimmed.to_string(),
                interval,
            });
        }
        let cron_expr = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            other => other,
        };
        Ok(Schedule::Cron {
            expr: trimmed.to_string(),
            cron: CronExpr::parse(cron_expr)?,
        })
    }

    /// The original expression string.
    pub fn expr(&self) -> &str {
        match self {
            Schedule::Cron { expr, .. } => expr,
            Schedule::Every { expr, .. } => expr,
        }
    }

    /// Next fire time strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { cron, .. } => cron.next_run(&after),
            Schedule::Every { interval, .. } => {
                Some(after + chrono::Duration::from_std(*interval).ok()?)
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.expr())
    }
}

/// Parse interval strings like `4h`, `90s`, `1h30m`.
fn parse_interval(s: &str) -> Result<Duration, ScheduleParseError> {
    if s.is_empty() {
        return Err(ScheduleParseError::InvalidInterval(s.to_string()));
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value = digits
            .parse::<u64>()
            .map_err(|_| ScheduleParseError::InvalidInterval(s.to_string()))?;
        digits.clear();
        total += match c {
            'h' => Duration::from_secs(value * 3600),
            'm' => Duration::from_secs(value * 60),
            's' => Duration::from_secs(value),
            _ => return Err(ScheduleParseError::InvalidInterval(s.to_string())),
        };
    }
    if !digits.is_empty() || total.is_zero() {
        return Err(ScheduleParseError::InvalidInterval(s.to_string()));
    }
    Ok(total)
}
