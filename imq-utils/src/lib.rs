#![deny(unsafe_code)]

//! Small helpers shared by the imq crates.
//!
//! - Human readable durations for configuration files (`"10s"`, `"1m30s"`, `"500ms"`)
//! - Millisecond timestamps for persisted records
//!
//! ```
//! let d = imq_utils::to_duration("1m30s");
//! assert_eq!(d.as_secs(), 90);
//! ```

use std::time::Duration;

use serde::de::{self, Deserialize, Deserializer};

/// Milliseconds since the unix epoch.
pub type TimestampMillis = i64;

/// Current time in milliseconds.
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Parses a duration made of `<number><unit>` groups.
///
/// Units: `ms`, `s`, `m`, `h`, `d`. A bare number is read as seconds.
/// Returns `None` for anything else, including an empty string.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        total += match unit.to_ascii_lowercase().as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86400),
            _ => return None,
        };
    }
    Some(total)
}

/// Like [`parse_duration`], but yields zero for unparsable input.
#[inline]
pub fn to_duration(text: &str) -> Duration {
    parse_duration(text).unwrap_or_default()
}

/// Serde helper for `Duration` fields written as `"10s"` or as plain seconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid duration: {text:?}"))),
    }
}
