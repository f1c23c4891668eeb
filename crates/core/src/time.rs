//! Timestamp parsing for client-supplied schedule times.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{DomainError, DomainResult};

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO-8601 timestamp.
///
/// Accepts RFC 3339 (`Z` or an explicit offset), naive date-times (taken as
/// UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(input: &str) -> DomainResult<DateTime<Utc>> {
    let s = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }

    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }

    Err(DomainError::validation(
        "Invalid scheduled_at format. Use ISO 8601 format (e.g., 2026-01-30T15:00:00)",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_rfc3339_with_zulu_and_offsets() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 30, 15, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2026-01-30T15:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-01-30T17:00:00+02:00").unwrap(), expected);
    }

    #[test]
    fn naive_values_are_utc() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 30, 15, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2026-01-30T15:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-01-30T15:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2026-01-30").unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 30, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in ["tomorrow", "2026-13-01T00:00:00", "30/01/2026", ""] {
            assert!(matches!(parse_timestamp(bad), Err(DomainError::Validation(_))), "{bad}");
        }
    }
}
