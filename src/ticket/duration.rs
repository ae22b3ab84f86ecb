//! ISO-8601 durations (`PT8H`, `P1DT30M`, `PT0.5S`) for policy configuration
//! and persistence.
//!
//! Only day, hour, minute and second designators are accepted; calendar units
//! (years, months) have no fixed length and are rejected. A bare integer is read
//! as seconds, which keeps env vars like `TESSERA_ST_TIME_TO_KILL=10` working.

use chrono::TimeDelta;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct DurationParseError {
    input: String,
    reason: &'static str,
}

impl DurationParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Parse an ISO-8601 duration or a plain number of seconds.
///
/// # Errors
///
/// Returns an error when the input is empty, uses unsupported designators or
/// overflows.
pub fn parse(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::new(input, "empty"));
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let secs = trimmed
            .parse::<u64>()
            .map_err(|_| DurationParseError::new(input, "seconds overflow"))?;
        return Ok(Duration::from_secs(secs));
    }

    let upper = trimmed.to_ascii_uppercase();
    let Some(body) = upper.strip_prefix('P') else {
        return Err(DurationParseError::new(input, "missing P designator"));
    };
    if body.is_empty() {
        return Err(DurationParseError::new(input, "no components"));
    }

    let mut total = Duration::ZERO;
    let mut in_time = false;
    let mut number = String::new();
    let mut seen_component = false;

    for ch in body.chars() {
        match ch {
            'T' => {
                if in_time || !number.is_empty() {
                    return Err(DurationParseError::new(input, "misplaced T designator"));
                }
                in_time = true;
            }
            '0'..='9' | '.' | ',' => number.push(if ch == ',' { '.' } else { ch }),
            'W' | 'D' | 'H' | 'M' | 'S' => {
                let unit_secs: f64 = match (ch, in_time) {
                    ('W', false) => 604_800.0,
                    ('D', false) => 86_400.0,
                    ('H', true) => 3_600.0,
                    ('M', true) => 60.0,
                    ('S', true) => 1.0,
                    ('M', false) => {
                        return Err(DurationParseError::new(input, "months are not supported"));
                    }
                    _ => return Err(DurationParseError::new(input, "unexpected designator")),
                };
                let value: f64 = number
                    .parse()
                    .map_err(|_| DurationParseError::new(input, "invalid number"))?;
                number.clear();
                let component = Duration::try_from_secs_f64(value * unit_secs)
                    .map_err(|_| DurationParseError::new(input, "component out of range"))?;
                total = total
                    .checked_add(component)
                    .ok_or_else(|| DurationParseError::new(input, "duration overflow"))?;
                seen_component = true;
            }
            'Y' => return Err(DurationParseError::new(input, "years are not supported")),
            _ => return Err(DurationParseError::new(input, "unexpected character")),
        }
    }

    if !number.is_empty() {
        return Err(DurationParseError::new(input, "trailing number without designator"));
    }
    if !seen_component {
        return Err(DurationParseError::new(input, "no components"));
    }
    Ok(total)
}

/// Format as the canonical ISO-8601 form (`PT0S` for zero).
#[must_use]
pub fn format(duration: Duration) -> String {
    let total = duration.as_secs();
    let millis = duration.subsec_millis();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || seconds > 0 || millis > 0 || days == 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if millis > 0 {
            let fraction = format!("{millis:03}");
            out.push_str(&format!("{seconds}.{}S", fraction.trim_end_matches('0')));
        } else if seconds > 0 || out.ends_with('T') {
            out.push_str(&format!("{seconds}S"));
        }
    }
    out
}

/// Convert to a chrono delta, saturating at one century.
#[must_use]
pub fn to_time_delta(duration: Duration) -> TimeDelta {
    const CENTURY_DAYS: i64 = 36_525;
    let cap = TimeDelta::days(CENTURY_DAYS);
    TimeDelta::from_std(duration).map_or(cap, |delta| delta.min(cap))
}

/// Serde adapter storing `std::time::Duration` as an ISO-8601 string.
pub mod iso8601 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format(*value))
    }

    /// # Errors
    ///
    /// Fails when the string is not a supported duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse(&raw).map_err(D::Error::custom)
    }
}
