//! Time parsing for the command-line tools
//!
//! Accepts the forms people actually type when queueing a post:
//! - Unix seconds: "1700000000"
//! - RFC 3339: "2025-11-20T15:00:00Z"
//! - Relative durations: "30m", "2h", "1 hour", "in 2 hours"
//! - Natural language: "tomorrow", "next monday 10am"
//!
//! Everything is resolved against an explicit `now` so callers can pass the
//! service clock.

use chrono::{DateTime, Utc};

use crate::error::{GramcastError, Result};

/// Parse a time expression into Unix seconds
///
/// # Errors
///
/// `InvalidInput` if the string is empty or matches none of the accepted
/// forms.
pub fn parse_time(input: &str, now: i64) -> Result<i64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(GramcastError::InvalidInput(
            "Time cannot be empty".to_string(),
        ));
    }

    if let Ok(timestamp) = input.parse::<i64>() {
        return Ok(timestamp);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp());
    }

    let relative = input.strip_prefix("in ").unwrap_or(input);
    if let Some(seconds) = parse_duration_secs(relative) {
        return now.checked_add(seconds).ok_or_else(|| {
            GramcastError::InvalidInput(format!("Time out of range: {}", input))
        });
    }

    let base = DateTime::<Utc>::from_timestamp(now, 0)
        .ok_or_else(|| GramcastError::InvalidInput(format!("Clock out of range: {}", now)))?;
    chrono_english::parse_date_string(input, base, chrono_english::Dialect::Us)
        .map(|dt| dt.timestamp())
        .map_err(|_| GramcastError::InvalidInput(format!("Could not parse time: {}", input)))
}

/// Parse a duration such as "90s" or "2h" into seconds
pub fn parse_duration_secs(input: &str) -> Option<i64> {
    humantime::parse_duration(input)
        .ok()
        .and_then(|d| i64::try_from(d.as_secs()).ok())
}

/// RFC 3339 rendering for human-facing output
pub fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}
