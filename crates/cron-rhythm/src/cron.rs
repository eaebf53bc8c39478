//! Cron-expression schedules backed by `croner`.

use std::fmt;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use croner::Cron;

use crate::{RhythmError, Schedule};

/// Cron schedule evaluated in a fixed timezone.
///
/// The anchor's second-of-minute is applied as a phase offset, so two jobs
/// on `*/2 * * * * *` anchored one second apart fire on alternating seconds.
#[derive(Clone)]
pub struct CronSchedule {
    expr: String,
    cron: Cron,
    tz: Tz,
}

impl CronSchedule {
    /// Parse a 5 or 6 field cron expression, or one of the `@` shortcuts.
    pub fn parse(expr: &str, tz: Tz) -> Result<Self, RhythmError> {
        let pattern = expand_shortcut(expr)?;
        let cron = Cron::new(pattern)
            .with_seconds_optional()
            .parse()
            .map_err(|e| RhythmError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expr: expr.to_string(),
            cron,
            tz,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }
}

fn expand_shortcut(expr: &str) -> Result<&str, RhythmError> {
    if !expr.starts_with('@') {
        return Ok(expr);
    }
    match expr {
        "@yearly" | "@annually" => Ok("0 0 0 1 1 *"),
        "@monthly" => Ok("0 0 0 1 * *"),
        "@weekly" => Ok("0 0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 0 * * *"),
        "@hourly" => Ok("0 0 * * * *"),
        _ => Err(RhythmError::InvalidCron {
            expr: expr.to_string(),
            reason: "unknown shortcut".to_string(),
        }),
    }
}

impl Schedule for CronSchedule {
    fn next(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let phase = TimeDelta::seconds(i64::from(start.second()));
        let shifted = now.checked_sub_signed(phase)?.with_timezone(&self.tz);
        let next = self.cron.find_next_occurrence(&shifted, false).ok()?;
        next.with_timezone(&Utc).checked_add_signed(phase)
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expr", &self.expr)
            .field("tz", &self.tz)
            .finish()
    }
}
