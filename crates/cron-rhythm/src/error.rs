//! Error types for rhythm parsing.

use thiserror::Error;

/// Errors that can occur while parsing a rhythm expression.
#[derive(Debug, Error)]
pub enum RhythmError {
    /// Expression was empty or whitespace
    #[error("Empty rhythm expression")]
    Empty,

    /// Cron expression or shortcut not understood
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    /// Interval could not be parsed or is shorter than one second
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// ISO-8601 repeat prefix malformed
    #[error("Invalid repeat: {0}")]
    InvalidRepeat(String),
}
