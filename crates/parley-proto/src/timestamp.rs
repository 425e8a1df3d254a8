//! Timestamp normalisation.
//!
//! Wire timestamps arrive as epoch seconds, epoch milliseconds, RFC 3339
//! strings, zone-less ISO strings (server `LocalDateTime`), or Jackson's
//! array form `[y, m, d, h, min, s, nanos]`. Anything unusable is replaced by
//! the caller's `now`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Epoch values below this are seconds, not milliseconds.
pub const SECONDS_THRESHOLD: i64 = 1_000_000_000_000;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Interpret a wire timestamp, or `None` if it cannot be understood.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            from_epoch(raw)
        },
        Value::String(s) => parse_text(s.trim()),
        Value::Array(parts) => parse_parts(parts),
        _ => None,
    }
}

/// [`parse_timestamp`], falling back to `now`.
pub fn normalize_timestamp(value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    value.and_then(parse_timestamp).unwrap_or(now)
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    let millis = if raw.abs() < SECONDS_THRESHOLD { raw.checked_mul(1000)? } else { raw };
    DateTime::from_timestamp_millis(millis)
}

fn parse_text(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    s.parse::<i64>().ok().and_then(from_epoch)
}

fn parse_parts(parts: &[Value]) -> Option<DateTime<Utc>> {
    let field = |i: usize| parts.get(i).map_or(Some(0), Value::as_u64);

    let year = i32::try_from(parts.first()?.as_i64()?).ok()?;
    let month = u32::try_from(parts.get(1)?.as_u64()?).ok()?;
    let day = u32::try_from(parts.get(2)?.as_u64()?).ok()?;
    let hour = u32::try_from(field(3)?).ok()?;
    let minute = u32::try_from(field(4)?).ok()?;
    let second = u32::try_from(field(5)?).ok()?;
    let nanos = u32::try_from(field(6)?).ok()?;

    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_nano_opt(hour, minute, second, nanos)
        .map(|naive| naive.and_utc())
}
