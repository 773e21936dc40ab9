//! Timeout strings such as `"1h30m"`, `"45s"` or `"500ms"`.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeoutParseError {
    #[error("Timeout is empty")]
    Empty,

    #[error("Timeout '{input}' has no unit after {value}")]
    MissingUnit { input: String, value: u64 },

    #[error("Timeout '{input}' uses unknown unit '{unit}'")]
    UnknownUnit { input: String, unit: String },

    #[error("Timeout '{input}' is malformed")]
    Malformed { input: String },
}

/// Parse a compound duration string (`w`, `d`, `h`, `m`, `s`, `ms` units).
pub fn parse_timeout(input: &str) -> Result<Duration, TimeoutParseError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(TimeoutParseError::Empty);
    }

    let mut total = Duration::ZERO;
    let mut chars = compact.chars().peekable();

    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(c);
            chars.next();
        }
        if digits.is_empty() {
            return Err(TimeoutParseError::Malformed {
                input: input.to_string(),
            });
        }
        let value: u64 = digits.parse().map_err(|_| TimeoutParseError::Malformed {
            input: input.to_string(),
        })?;

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }

        let step = match unit.as_str() {
            "" => {
                return Err(TimeoutParseError::MissingUnit {
                    input: input.to_string(),
                    value,
                });
            }
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3_600),
            "d" => Duration::from_secs(value * 86_400),
            "w" => Duration::from_secs(value * 604_800),
            other => {
                return Err(TimeoutParseError::UnknownUnit {
                    input: input.to_string(),
                    unit: other.to_string(),
                });
            }
        };
        total += step;
    }

    Ok(total)
}

/// Render a duration back into the compact form accepted by [`parse_timeout`].
pub fn format_timeout(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    let mut millis = duration.as_millis() as u64;
    let mut out = String::new();
    for (unit, size) in [
        ("d", 86_400_000u64),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ] {
        if millis >= size {
            out.push_str(&format!("{}{}", millis / size, unit));
            millis %= size;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_timeout("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_timeout("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_timeout(" 1m 5s ").unwrap(), Duration::from_secs(65));
        assert_eq!(parse_timeout("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_timeout(""), Err(TimeoutParseError::Empty));
        assert!(matches!(
            parse_timeout("10"),
            Err(TimeoutParseError::MissingUnit { value: 10, .. })
        ));
        assert!(matches!(
            parse_timeout("3y"),
            Err(TimeoutParseError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_timeout("m5"),
            Err(TimeoutParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_format_timeout() {
        assert_eq!(format_timeout(Duration::from_secs(5_400)), "1h30m");
        assert_eq!(format_timeout(Duration::from_millis(1_500)), "1s500ms");
        assert_eq!(format_timeout(Duration::ZERO), "0s");
    }
}
