//! Duration strings (`"30s"`, `"5m"`, `"1h30m"`).
//!
//! Parsing is `humantime`'s grammar plus a bare `"0"`. Formatting emits the
//! compact Go form (`1h30m`), which the API server's duration pattern accepts.
//!
//! Used through `#[serde(with = "duration")]` and
//! `#[serde(with = "duration::option")]` on spec fields.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("invalid duration {input:?}: {reason}")]
    Invalid { input: String, reason: String },

    #[error("duration {0:?} is out of range")]
    OutOfRange(String),
}

/// Parse a duration such as `1h30m`, `90s` or `250ms`.
pub fn parse(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| match e {
        humantime::DurationError::NumberOverflow => DurationParseError::OutOfRange(input.to_string()),
        other => DurationParseError::Invalid {
            input: input.to_string(),
            reason: other.to_string(),
        },
    })
}

/// Format a duration the way `parse` reads it back.
pub fn format(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }

    let mut out = String::new();
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        let _ = write!(out, "{h}h");
    }
    if m > 0 {
        let _ = write!(out, "{m}m");
    }
    if s > 0 {
        let _ = write!(out, "{s}s");
    }
    let millis = duration.subsec_millis();
    if millis > 0 {
        let _ = write!(out, "{millis}ms");
    }
    if out.is_empty() {
        let _ = write!(out, "{}ns", duration.subsec_nanos());
    }
    out
}

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(*duration))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse(&s).map_err(serde::de::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&super::format(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
