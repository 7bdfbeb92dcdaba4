//! Human-readable time spans as they appear in plan files.
//!
//! Accepts the Go-style strings used by k6 options: `"500ms"`, `"30s"`,
//! `"5m"`, `"2h"`, and compound forms such as `"1m30s"` or `"1.5s"`.
//! A bare `"0"` is allowed; any other unit-less number is rejected.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Parse a duration string into a [`Duration`].
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: input.to_string(),
        reason: reason.to_string(),
    };

    if s.is_empty() {
        return Err(invalid("empty string"));
    }
    if s.starts_with('-') {
        return Err(ConfigError::NegativeDuration(input.to_string()));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Wrapper that renders a [`Duration`] the way it is written in plan files.
pub struct Human(pub Duration);

impl fmt::Display for Human {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0;
        if d.is_zero() {
            return write!(f, "0s");
        }
        if d.subsec_nanos() != 0 && d < Duration::from_secs(1) {
            return write!(f, "{}ms", d.as_millis());
        }
        let secs = d.as_secs();
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if h > 0 {
            write!(f, "{h}h")?;
        }
        if m > 0 {
            write!(f, "{m}m")?;
        }
        if s > 0 || (h == 0 && m == 0) {
            let millis = d.subsec_millis();
            if millis > 0 {
                write!(f, "{s}.{millis:03}s")?;
            } else {
                write!(f, "{s}s")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2s", Duration::from_secs(2))]
    #[case("500ms", Duration::from_millis(500))]
    #[case("5m", Duration::from_secs(300))]
    #[case("2h", Duration::from_secs(7200))]
    #[case("1m30s", Duration::from_secs(90))]
    #[case("1.5s", Duration::from_millis(1500))]
    #[case("0", Duration::ZERO)]
    #[case(" 10s ", Duration::from_secs(10))]
    fn parses_valid_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("10")]
    #[case("s")]
    #[case("10 parsecs")]
    #[case("1x")]
    fn rejects_malformed_durations(#[case] input: &str) {
        assert!(matches!(
            parse_duration(input),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn rejects_negative_durations() {
        assert!(matches!(
            parse_duration("-5s"),
            Err(ConfigError::NegativeDuration(_))
        ));
    }

    #[test]
    fn human_rendering() {
        assert_eq!(Human(Duration::from_secs(7500)).to_string(), "2h5m");
        assert_eq!(Human(Duration::from_secs(90)).to_string(), "1m30s");
        assert_eq!(Human(Duration::from_millis(250)).to_string(), "250ms");
        assert_eq!(Human(Duration::ZERO).to_string(), "0s");
    }
}
