//! Field-level validation errors and duration handling for build resources

use std::time::Duration;
use thiserror::Error;

/// Structured specification errors. These are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field(s): {field}")]
    MissingField { field: String },

    #[error("duplicate step name: {name}")]
    DuplicateStepName { name: String },

    #[error("duplicate volume name: {name}")]
    DuplicateVolumeName { name: String },

    #[error("duplicate argument name: {name}")]
    DuplicateArgumentName { name: String },

    #[error("duplicate parameter name: {name}")]
    DuplicateParameterName { name: String },

    #[error("a build may specify steps or a template, not both")]
    StepsAndTemplate,

    #[error("source {source_name:?} must specify exactly one of git, gcs or custom")]
    UnsupportedSource { source_name: String },

    #[error("custom source container may not specify a name, got {name:?}")]
    CustomSourceNamed { name: String },

    #[error("only one source may specify a subPath")]
    MultipleSubPaths,

    #[error("nested or unterminated placeholder in {value:?}")]
    NestedPlaceholder { value: String },

    #[error("argument {name:?} does not match any template parameter")]
    UnknownArgument { name: String },

    #[error("invalid timeout {value:?}: {reason}")]
    InvalidTimeout { value: String, reason: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
    }
}

/// Parse a Go-style duration string such as "10m", "1h30m", "1.5h" or "90s".
///
/// Negative durations are rejected.
pub fn parse_duration(raw: &str) -> Result<Duration, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidTimeout {
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.starts_with('-') {
        return Err(invalid("must be >= 0"));
    }
    let mut rest = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
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
        let unit_nanos = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];
        total_nanos += value * unit_nanos;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Render a duration the way Go prints it, e.g. "10m0s" or "1h30m0s"
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let millis = duration.subsec_millis();
    let seconds = if millis > 0 {
        format!("{seconds}.{millis:03}")
            .trim_end_matches('0')
            .to_string()
    } else {
        seconds.to_string()
    };

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
