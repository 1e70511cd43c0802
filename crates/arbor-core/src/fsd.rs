//! Flexible Specification of Duration: human-friendly time intervals.
//!
//! Accepted forms: a bare number of seconds (`"30"`, `"0.5"`) or a number
//! with one of the suffixes `ms`, `s`, `m`, `h`, `d`.

use std::time::Duration;

use thiserror::Error;

/// FSD parse failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid duration: {0:?}")]
pub struct FsdError(pub String);

/// Parse an FSD string into a [`Duration`].
pub fn parse_duration(s: &str) -> Result<Duration, FsdError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FsdError(s.to_string()));
    }
    let (number, multiplier) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 0.001)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60.0)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600.0)
    } else if let Some(stripped) = s.strip_suffix('d') {
        (stripped, 86400.0)
    } else {
        (s, 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| FsdError(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(FsdError(s.to_string()));
    }
    Ok(Duration::from_secs_f64(value * multiplier))
}

/// Format a duration in the most natural FSD unit.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    let (value, unit) = if secs < 1.0 {
        (secs * 1000.0, "ms")
    } else if secs < 60.0 {
        (secs, "s")
    } else if secs < 3600.0 {
        (secs / 60.0, "m")
    } else if secs < 86400.0 {
        (secs / 3600.0, "h")
    } else {
        (secs / 86400.0, "d")
    };
    if (value - value.round()).abs() < 1e-9 {
        format!("{}{}", value.round() as u64, unit)
    } else {
        format!("{:.4}{}", value, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_suffixes() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn parse_bare_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("0.25").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("nan").is_err());
    }

    #[test]
    fn format_picks_unit() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(172800)), "2d");
    }

    #[test]
    fn round_trip() {
        for s in ["5s", "2m", "500ms", "3h"] {
            let d = parse_duration(s).unwrap();
            assert_eq!(format_duration(d), s);
        }
    }
}
