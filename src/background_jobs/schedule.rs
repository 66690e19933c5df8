use super::scheduler::SchedulerError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

/// Static configuration for one named job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub name: String,
    /// Cron expression with optional seconds field, or a descriptor such as `@daily`.
    /// Days of the week run 0-6 from Sunday; 7 is also Sunday.
    pub schedule: String,
    /// Deadline for the whole run, retries included.
    pub timeout: Duration,
    /// Attempts per run. 0 still means one attempt.
    pub max_retries: u32,
    pub enabled: bool,
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            timeout,
            max_retries,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate the definition and parse its schedule.
    pub fn parse_schedule(&self) -> Result<CronSchedule, SchedulerError> {
        if self.timeout.is_zero() {
            return Err(SchedulerError::InvalidTimeout {
                job: self.name.clone(),
            });
        }
        CronSchedule::parse(&self.schedule).map_err(|reason| SchedulerError::InvalidSchedule {
            job: self.name.clone(),
            reason,
        })
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let normalized = normalize_expression(expression)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| e.to_string())?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

fn normalize_expression(expression: &str) -> Result<String, String> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err("empty schedule expression".to_string());
    }

    if trimmed.starts_with('@') {
        let descriptor = match trimmed {
            "@yearly" | "@annually" => "@yearly",
            "@monthly" => "@monthly",
            "@weekly" => "@weekly",
            "@daily" | "@midnight" => "@daily",
            "@hourly" => "@hourly",
            other => return Err(format!("unknown descriptor {}", other)),
        };
        return Ok(descriptor.to_string());
    }

    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        // seconds omitted
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => return Err(format!("expected 5 or 6 fields, got {}", n)),
    }
    fields[5] = convert_day_of_week(&fields[5])?;
    Ok(fields.join(" "))
}

/// Map day-of-week numbers from cron's 0-7 (0 and 7 = Sunday) to the
/// `cron` crate's 1-7 (1 = Sunday). Names, `*` and `?` pass through.
fn convert_day_of_week(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(convert_day_of_week_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn convert_day_of_week_item(item: &str) -> Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

    if let Some((start, end)) = range.split_once('-') {
        let (Some(start), Some(end)) = (day_number(start)?, day_number(end)?) else {
            return Ok(item.to_string());
        };
        if start > end {
            return Err(format!("day-of-week range {} runs backwards", range));
        }
        if end == 7 && start > 0 {
            // Sunday at the end of the range wraps to the crate's 1
            if step.is_some() {
                return Err(format!("stepped day-of-week range {} ending on 7", range));
            }
            if start == 7 {
                return Ok("1".to_string());
            }
            return Ok(format!("{}-7,1", start + 1));
        }
        let end = end.min(6);
        return Ok(format!("{}-{}{}", start + 1, end + 1, suffix));
    }

    match day_number(range)? {
        Some(day) => Ok(format!("{}{}", crate_day(day), suffix)),
        None => Ok(item.to_string()),
    }
}

fn day_number(value: &str) -> Result<Option<u32>, String> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    let day: u32 = value
        .parse()
        .map_err(|_| format!("invalid day of week {}", value))?;
    if day > 7 {
        return Err(format!("day of week {} out of range 0-7", day));
    }
    Ok(Some(day))
}

fn crate_day(day: u32) -> u32 {
    if day == 7 {
        1
    } else {
        day + 1
    }
}
