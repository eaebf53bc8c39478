//! Fixed-delay schedules: `@every <duration>` and ISO-8601 `R<n>/<duration>`.

use chrono::{DateTime, TimeDelta, Utc};

use crate::{RhythmError, Schedule};

/// Fires at `start + k * delay` for k >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantDelay {
    delay: TimeDelta,
}

impl ConstantDelay {
    /// Delays shorter than one second are rejected; occurrences are
    /// identified by their Unix second.
    pub fn new(delay: TimeDelta) -> Result<Self, RhythmError> {
        if delay < TimeDelta::seconds(1) {
            return Err(RhythmError::InvalidDuration(format!(
                "delay must be at least 1s, got {}",
                delay
            )));
        }
        Ok(Self { delay })
    }

    pub fn delay(&self) -> TimeDelta {
        self.delay
    }
}

impl Schedule for ConstantDelay {
    fn next(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now < start {
            return Some(start);
        }
        let elapsed = (now - start).num_milliseconds();
        let step = self.delay.num_milliseconds();
        let periods = i32::try_from(elapsed / step + 1).ok()?;
        start.checked_add_signed(self.delay.checked_mul(periods)?)
    }
}

/// Parse the argument of `@every`, e.g. `1h`, `1m30s`, `45s`.
pub(crate) fn parse_every(input: &str) -> Result<TimeDelta, RhythmError> {
    let invalid = || RhythmError::InvalidDuration(input.to_string());
    if input.is_empty() {
        return Err(invalid());
    }

    let mut total = TimeDelta::zero();
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let part = match c {
            'h' => TimeDelta::try_hours(n),
            'm' => TimeDelta::try_minutes(n),
            's' => TimeDelta::try_seconds(n),
            _ => None,
        }
        .ok_or_else(invalid)?;
        total = total.checked_add(&part).ok_or_else(invalid)?;
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(total)
}

/// Parse `R<n>/<duration>` or `R/<duration>` into (repeats, delay).
pub(crate) fn parse_iso_interval(input: &str) -> Result<(Option<u32>, TimeDelta), RhythmError> {
    let (head, duration) = input
        .split_once('/')
        .ok_or_else(|| RhythmError::InvalidRepeat(input.to_string()))?;

    let count = head
        .strip_prefix('R')
        .ok_or_else(|| RhythmError::InvalidRepeat(input.to_string()))?;
    let repeats = if count.is_empty() {
        None
    } else {
        let n: u32 = count
            .parse()
            .map_err(|_| RhythmError::InvalidRepeat(input.to_string()))?;
        (n > 0).then_some(n)
    };

    Ok((repeats, parse_iso_duration(duration)?))
}

/// Parse `P[nW][nD][T[nH][nM][nS]]`. Years and months are rejected since
/// their length varies.
fn parse_iso_duration(input: &str) -> Result<TimeDelta, RhythmError> {
    let invalid = || RhythmError::InvalidDuration(input.to_string());
    let body = input.strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let mut total = TimeDelta::zero();
    let mut digits = String::new();
    let mut in_time = false;
    let mut components = 0;
    for c in body.chars() {
        if c == 'T' {
            if in_time || !digits.is_empty() {
                return Err(invalid());
            }
            in_time = true;
            continue;
        }
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let part = match (in_time, c) {
            (false, 'W') => TimeDelta::try_weeks(n),
            (false, 'D') => TimeDelta::try_days(n),
            (true, 'H') => TimeDelta::try_hours(n),
            (true, 'M') => TimeDelta::try_minutes(n),
            (true, 'S') => TimeDelta::try_seconds(n),
            _ => None,
        }
        .ok_or_else(invalid)?;
        total = total.checked_add(&part).ok_or_else(invalid)?;
        components += 1;
    }
    if !digits.is_empty() || components == 0 {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_parse_every() {
        assert_eq!(parse_every("1m30s").unwrap(), TimeDelta::seconds(90));
        assert_eq!(parse_every("2h").unwrap(), TimeDelta::hours(2));
        assert!(parse_every("").is_err());
        assert!(parse_every("10").is_err());
        assert!(parse_every("5x").is_err());
    }

    #[test]
    fn test_parse_iso_interval() {
        let (repeats, delay) = parse_iso_interval("R3/PT1S").unwrap();
        assert_eq!(repeats, Some(3));
        assert_eq!(delay, TimeDelta::seconds(1));

        let (repeats, delay) = parse_iso_interval("R/P1DT2H").unwrap();
        assert_eq!(repeats, None);
        assert_eq!(delay, TimeDelta::hours(26));

        assert!(parse_iso_interval("R3").is_err());
        assert!(parse_iso_interval("Rx/PT1S").is_err());
        assert!(parse_iso_interval("R1/P1M").is_err());
        assert!(parse_iso_interval("R1/PT").is_err());
    }

    #[test]
    fn test_sub_second_delay_rejected() {
        assert!(ConstantDelay::new(TimeDelta::milliseconds(500)).is_err());
        assert!(ConstantDelay::new(TimeDelta::zero()).is_err());
    }

    #[test]
    fn test_constant_delay_anchors_at_start() {
        let every3 = ConstantDelay::new(TimeDelta::seconds(3)).unwrap();
        assert_eq!(every3.next(at(1), at(0)), Some(at(1)));
        assert_eq!(every3.next(at(1), at(1)), Some(at(4)));
        assert_eq!(every3.next(at(1), at(5)), Some(at(7)));
        assert_eq!(every3.next(at(1), at(7)), Some(at(10)));
    }
}
