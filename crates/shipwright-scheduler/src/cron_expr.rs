//! Cron expression validation and timezone-aware next-run computation

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use shipwright_core::ValidationError;

/// Parse a cron expression, accepting the common five-field form
///
/// The `cron` crate parses six/seven fields (with seconds); five-field
/// expressions get a zero seconds field prepended.
pub fn validate_cron(expr: &str) -> Result<Schedule, ValidationError> {
    let normalized = normalize(expr);
    Schedule::from_str(&normalized)
        .map_err(|e| ValidationError::InvalidCron(format!("{expr}: {e}")))
}

fn normalize(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_tz(timezone: &str) -> Result<Tz, ValidationError> {
    timezone
        .parse()
        .map_err(|_| ValidationError::InvalidTimezone(timezone.to_string()))
}

/// First fire strictly after `after`, evaluated in the job's timezone
pub fn next_run_after(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let schedule = validate_cron(expr)?;
    let tz = parse_tz(timezone)?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}
