//! Environment variable parsing helpers.
//!
//! Services load configuration from a `HashMap<String, String>` so tests can
//! pass variables directly. These helpers produce the validation messages
//! each service wraps in its own `ConfigError`.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

/// Parse `key` as a value greater than zero, or fall back to `default`.
///
/// # Errors
///
/// Returns a human-readable message if the value does not parse or is zero.
pub fn parse_positive<T>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, String>
where
    T: FromStr + PartialOrd + Default,
    T::Err: Display,
{
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };

    let value: T = raw
        .parse()
        .map_err(|e| format!("{key} must be a valid positive number, got '{raw}': {e}"))?;

    if value <= T::default() {
        return Err(format!("{key} must be greater than 0"));
    }

    Ok(value)
}

/// Parse `key` as an `f64` within `[min, max]`, or fall back to `default`.
///
/// # Errors
///
/// Returns a human-readable message if the value does not parse or is out
/// of range.
pub fn parse_f64_in_range(
    vars: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, String> {
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };

    let value: f64 = raw
        .parse()
        .map_err(|e| format!("{key} must be a number, got '{raw}': {e}"))?;

    if !(min..=max).contains(&value) {
        return Err(format!("{key} must be between {min} and {max}, got {value}"));
    }

    Ok(value)
}

/// Parse `key` as a boolean flag (`true`/`1`/`yes`), defaulting to false.
#[must_use]
pub fn parse_flag(vars: &HashMap<String, String>, key: &str) -> bool {
    vars.get(key)
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}
