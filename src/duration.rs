//! Duration grammar and human-readable rendering for disarm times.
//!
//! The grammar is an optional `<digits>h`, then optional `<digits>m`, then
//! optional `<digits>s`, order fixed, with at least one component present.
//! `"90s"` stays 90 seconds; components are never normalized into each other.

use crate::error::{HomeguardError, Result};
use std::time::Duration;

/// Parse a duration string like "1h30m" or "90s" into a `Duration`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let err = || HomeguardError::DurationParse {
        input: input.to_string(),
    };

    let mut rest = input;
    let mut total_secs: u64 = 0;
    let mut matched = false;

    // Units must appear in this order, each at most once.
    for (unit, mul) in [('h', 3600u64), ('m', 60), ('s', 1)] {
        let digits_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits_len == 0 {
            continue;
        }
        if rest[digits_len..].starts_with(unit) {
            let value: u64 = rest[..digits_len].parse().map_err(|_| err())?;
            total_secs = total_secs
                .checked_add(value.checked_mul(mul).ok_or_else(err)?)
                .ok_or_else(err)?;
            rest = &rest[digits_len + 1..];
            matched = true;
        }
    }

    if !matched || !rest.is_empty() {
        return Err(err());
    }

    Ok(Duration::from_secs(total_secs))
}

/// Render a second count as a human sentence, e.g. "1 hour, 30 minutes".
/// Zero renders as "0 seconds".
pub fn human_time(total_secs: u64) -> String {
    if total_secs == 0 {
        return "0 seconds".to_string();
    }

    const UNITS: [(&str, u64); 4] = [
        ("day", 86_400),
        ("hour", 3_600),
        ("minute", 60),
        ("second", 1),
    ];

    let mut secs = total_secs;
    let mut parts = Vec::new();
    for (unit, mul) in UNITS {
        let n = secs / mul;
        if n > 0 {
            secs -= n * mul;
            parts.push(format!("{} {}{}", n, unit, if n == 1 { "" } else { "s" }));
        }
    }

    parts.join(", ")
}
