//! Go-style duration strings.
//!
//! A duration is a sequence of decimal numbers, each with an optional fraction and a unit
//! suffix, e.g. `300ms`, `1.5h` or `2h45m`. Valid units are `ns`, `us` (or `µs`), `ms`, `s`,
//! `m` and `h`. A bare `0` is accepted. Negative durations are rejected, except for negative
//! zero. Durations longer than `i64::MAX` nanoseconds are out of range.

use crate::{Error, ErrorContext, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)?(?:\.(\d*))?(ns|us|µs|μs|ms|s|m|h)").expect("duration regex is valid")
});

/// Longest representable duration: `i64::MAX` nanoseconds, roughly 292 years.
const MAX_NANOS: u128 = i64::MAX as u128;

fn unit_nanos(unit: &str) -> u128 {
    match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        _ => 3_600 * 1_000_000_000,
    }
}

fn invalid(raw: &str, why: &str) -> Error {
    Error::configuration_with_context(
        format!("invalid duration \"{}\"", raw),
        ErrorContext::new().with_details(why.to_string()),
    )
}

/// Parse a duration string such as `"10m"` or `"1h30m"`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    if s.is_empty() {
        return Err(invalid(raw, "empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut pos = 0;
    for caps in COMPONENT.captures_iter(s) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        if whole.start != pos {
            return Err(invalid(raw, "unexpected characters"));
        }
        pos = whole.end;

        let int_part = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let frac_part = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid(raw, "missing number before unit"));
        }
        let unit = unit_nanos(&caps[3]);

        let int_value: u128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| invalid(raw, "number out of range"))?
        };
        let mut nanos = int_value
            .checked_mul(unit)
            .ok_or_else(|| invalid(raw, "duration out of range"))?;

        // Fractions beyond nanosecond precision are truncated.
        let mut scale = unit;
        for digit in frac_part.chars() {
            scale /= 10;
            if scale == 0 {
                break;
            }
            nanos += u128::from(digit.to_digit(10).unwrap_or(0)) * scale;
        }

        total = total
            .checked_add(nanos)
            .ok_or_else(|| invalid(raw, "duration out of range"))?;
    }

    if pos != s.len() {
        return Err(invalid(raw, "missing or unknown unit"));
    }

    if total > MAX_NANOS {
        return Err(invalid(raw, "duration out of range"));
    }
    if negative && total != 0 {
        return Err(invalid(raw, "negative durations are not supported"));
    }

    // Bounded by MAX_NANOS, so the seconds fit in a u64.
    Ok(Duration::new(
        (total / 1_000_000_000) as u64,
        (total % 1_000_000_000) as u32,
    ))
}
