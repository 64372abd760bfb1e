//! Human-readable durations such as `90s`, `5m`, `1h30m` or `250ms`.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Error returned for a malformed duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration '{input}': expected values like 90s, 5m, 1h30m or 250ms")]
pub struct DurationParseError {
    /// The rejected input.
    pub input: String,
}

#[allow(clippy::unwrap_used)]
fn component_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|us|ns|h|m|s)").unwrap())
}

/// Parses a duration string.
///
/// Components may be combined (`1h30m`, `2m30s`) and fractional values are
/// accepted (`1.5h`). A bare `0` is zero.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    let err = || DurationParseError {
        input: input.to_string(),
    };

    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    if trimmed.is_empty() {
        return Err(err());
    }

    let mut cursor = 0;
    let mut total = 0f64;
    for caps in component_regex().captures_iter(trimmed) {
        let Some(whole) = caps.get(0) else {
            return Err(err());
        };
        if whole.start() != cursor {
            return Err(err());
        }
        cursor = whole.end();

        let value: f64 = caps[1].parse().map_err(|_| err())?;
        let seconds = match &caps[2] {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1_000.0,
            "us" => value / 1_000_000.0,
            _ => value / 1_000_000_000.0,
        };
        total += seconds;
    }

    if cursor != trimmed.len() {
        return Err(err());
    }
    Ok(Duration::from_secs_f64(total))
}

/// Formats a duration in the same notation [`parse_duration`] accepts.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    if duration.subsec_nanos() != 0 && duration.as_secs() == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let mut secs = duration.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

/// Serde adapter for `Duration` fields written as strings.
pub mod serde_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes as a duration string.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    /// Deserializes from a duration string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "10", "5 minutes", "m5", "5m!"] {
            assert!(parse_duration(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_format_is_parseable() {
        for d in [
            Duration::from_secs(5400),
            Duration::from_secs(42),
            Duration::from_millis(250),
            Duration::ZERO,
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
    }
}
