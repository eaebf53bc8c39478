//! Rhythm parsing for shard-cron.
//!
//! A rhythm is the schedule string attached to a job. Parsing one yields a
//! [`Schedule`], a pure function from (anchor, now) to the next fire
//! instant, plus an optional repeat bound embedded in the expression.
//!
//! # Supported forms
//!
//! - Cron, 5 or 6 fields (seconds optional): `*/2 * * * * *`, `0 30 4 * * *`
//! - Shortcuts: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`
//! - Fixed delay: `@every 1m30s`
//! - ISO-8601 repeating interval: `R5/PT10S` (five repeats), `R/PT1H`
//!
//! # Example
//!
//! ```
//! use chrono::{DateTime, Utc};
//!
//! let rhythm = cron_rhythm::parse("R3/PT2S").unwrap();
//! assert_eq!(rhythm.repeats, Some(3));
//!
//! let start = DateTime::<Utc>::UNIX_EPOCH;
//! let now = DateTime::from_timestamp(5, 0).unwrap();
//! let next = rhythm.schedule.next(start, now).unwrap();
//! assert_eq!(next.timestamp(), 6);
//! ```

mod cron;
mod delay;
mod error;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub use crate::cron::CronSchedule;
pub use crate::delay::ConstantDelay;
pub use crate::error::RhythmError;

/// Next-fire function compiled from a rhythm.
pub trait Schedule: Send + Sync + fmt::Debug {
    /// Earliest fire instant strictly after `now`, phase-anchored at `start`.
    ///
    /// Never returns an instant before `start`. Returns `None` when the
    /// schedule can no longer be satisfied.
    fn next(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Result of parsing a rhythm expression.
#[derive(Debug, Clone)]
pub struct Rhythm {
    pub schedule: Arc<dyn Schedule>,
    /// Repeat bound embedded in the expression, if any
    pub repeats: Option<u32>,
}

/// Parse a rhythm, evaluating cron forms in UTC.
pub fn parse(expr: &str) -> Result<Rhythm, RhythmError> {
    parse_in(expr, Tz::UTC)
}

/// Parse a rhythm, evaluating cron forms in `tz`.
pub fn parse_in(expr: &str, tz: Tz) -> Result<Rhythm, RhythmError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(RhythmError::Empty);
    }

    if let Some(interval) = expr.strip_prefix("@every") {
        let delay = delay::parse_every(interval.trim())?;
        return Ok(Rhythm {
            schedule: Arc::new(ConstantDelay::new(delay)?),
            repeats: None,
        });
    }

    if expr.starts_with('R') {
        let (repeats, delay) = delay::parse_iso_interval(expr)?;
        return Ok(Rhythm {
            schedule: Arc::new(ConstantDelay::new(delay)?),
            repeats,
        });
    }

    Ok(Rhythm {
        schedule: Arc::new(CronSchedule::parse(expr, tz)?),
        repeats: None,
    })
}
