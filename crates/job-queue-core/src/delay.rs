//! Delays given either as whole seconds or as relative time expressions
//! such as `"10 seconds"`, `"10min"` or `"+1 hour 30 minutes"`.

use crate::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest delay or time-to-run a job may carry, as beanstalk stores both
/// in 32 bits.
pub const MAX_DELAY_SECS: u64 = u32::MAX as u64;

/// Delay before a job becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delay {
    Seconds(i64),
    Relative(String),
}

impl Delay {
    /// No delay: the job is ready immediately
    pub const NONE: Delay = Delay::Seconds(0);

    /// Resolve to a duration between zero and [`MAX_DELAY_SECS`].
    pub fn resolve(&self) -> Result<Duration> {
        let seconds = match self {
            Delay::Seconds(seconds) => *seconds,
            Delay::Relative(expr) => parse_relative(expr)?,
        };

        if seconds < 0 {
            return Err(QueueError::InvalidArgument(format!(
                "You cannot schedule a job in the past (delay was {})",
                seconds
            )));
        }

        let delay = Duration::from_secs(seconds as u64);
        check_bound("delay", delay)?;
        Ok(delay)
    }
}

/// Reject a delay or time-to-run longer than [`MAX_DELAY_SECS`].
pub fn check_bound(what: &str, duration: Duration) -> Result<()> {
    if duration.as_secs() > MAX_DELAY_SECS {
        return Err(QueueError::InvalidArgument(format!(
            "The {} cannot exceed {}s (was {}s)",
            what,
            MAX_DELAY_SECS,
            duration.as_secs()
        )));
    }

    Ok(())
}

impl Default for Delay {
    fn default() -> Self {
        Delay::NONE
    }
}

impl From<i64> for Delay {
    fn from(seconds: i64) -> Self {
        Delay::Seconds(seconds)
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::Seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
    }
}

impl From<&str> for Delay {
    fn from(expr: &str) -> Self {
        Delay::Relative(expr.to_string())
    }
}

impl From<String> for Delay {
    fn from(expr: String) -> Self {
        Delay::Relative(expr)
    }
}

fn unit_seconds(unit: &str) -> Option<i64> {
    match unit.to_ascii_lowercase().as_str() {
        "sec" | "secs" | "second" | "seconds" => Some(1),
        "min" | "mins" | "minute" | "minutes" => Some(60),
        "hour" | "hours" => Some(3_600),
        "day" | "days" => Some(86_400),
        "week" | "weeks" => Some(604_800),
        _ => None,
    }
}

/// Parse a relative time expression into signed seconds.
pub fn parse_relative(expr: &str) -> Result<i64> {
    let invalid = || QueueError::InvalidArgument(format!("Invalid relative time expression \"{}\"", expr));

    let mut rest = expr.trim();
    if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped.trim_start();
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: i64 = 0;
    while !rest.is_empty() {
        // signed number
        let sign_len = usize::from(rest.starts_with(['-', '+']));
        let digits = rest[sign_len..]
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len() - sign_len);
        if digits == 0 {
            return Err(invalid());
        }
        let amount: i64 = rest[..sign_len + digits].parse().map_err(|_| invalid())?;
        rest = rest[sign_len + digits..].trim_start();

        // unit
        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = unit_seconds(&rest[..unit_len]).ok_or_else(invalid)?;
        rest = rest[unit_len..].trim_start();

        total = amount
            .checked_mul(unit)
            .and_then(|seconds| total.checked_add(seconds))
            .ok_or_else(invalid)?;
    }

    Ok(total)
}
