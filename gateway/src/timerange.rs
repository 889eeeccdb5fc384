//! Shared time-range normalization for the usage/abuse queries: missing
//! `to_ts` means now, missing `from_ts` means `to_ts - default_hours`,
//! naive timestamps are read as UTC, and inverted ranges are a 400.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use common_http_errors::{ApiError, ApiResult};
use serde::{de, Deserialize, Deserializer};

pub fn resolve_timerange(
    from_ts: Option<DateTime<Utc>>,
    to_ts: Option<DateTime<Utc>>,
    default_hours: i64,
) -> ApiResult<(DateTime<Utc>, DateTime<Utc>)> {
    let to_ts = to_ts.unwrap_or_else(Utc::now);
    let from_ts = from_ts.unwrap_or(to_ts - Duration::hours(default_hours));
    if from_ts > to_ts {
        return Err(ApiError::bad_request("from_ts must be <= to_ts"));
    }
    Ok((from_ts, to_ts))
}

/// Accepts RFC 3339 as well as naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` and
/// bare dates, treating naive values as UTC.
pub fn flexible_ts<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    parse_timestamp(raw).map(Some).map_err(de::Error::custom)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("invalid timestamp: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_to_last_24_hours() {
        let (from_ts, to_ts) = resolve_timerange(None, None, 24).unwrap();
        assert_eq!(to_ts - from_ts, Duration::hours(24));
    }

    #[test]
    fn missing_from_is_anchored_to_explicit_to() {
        let to = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let (from_ts, to_ts) = resolve_timerange(None, Some(to), 24).unwrap();
        assert_eq!(to_ts, to);
        assert_eq!(from_ts, to - Duration::hours(24));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let to = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let from = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let result = resolve_timerange(Some(from), Some(to), 24);
        assert!(result.is_err());
    }

    #[test]
    fn parses_rfc3339_and_naive_forms() {
        let explicit = parse_timestamp("2025-06-01T12:00:00Z").unwrap();
        let offset = parse_timestamp("2025-06-01T14:00:00+02:00").unwrap();
        assert_eq!(explicit, offset);

        let naive = parse_timestamp("2025-06-01T12:00:00").unwrap();
        assert_eq!(naive, explicit);

        let spaced = parse_timestamp("2025-06-01 12:00:00.250").unwrap();
        assert!(spaced > explicit);

        let date_only = parse_timestamp("2025-06-01").unwrap();
        assert_eq!(date_only, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }
}
