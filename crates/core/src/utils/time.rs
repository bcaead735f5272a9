use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Exchange timestamps are milliseconds since the epoch. Out-of-range values
/// clamp to the epoch rather than failing.
pub fn timestamp_to_datetime(timestamp_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default()
}

pub fn datetime_to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn parse_iso8601(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversion() {
        let dt = timestamp_to_datetime(1_499_827_319_559);
        assert_eq!(datetime_to_timestamp(dt), 1_499_827_319_559);
        assert_eq!(dt.to_rfc3339(), "2017-07-12T02:41:59.559+00:00");
    }

    #[test]
    fn test_iso8601_parsing() {
        let parsed = parse_iso8601("2023-01-01T12:00:00Z").unwrap();
        assert_eq!(datetime_to_timestamp(parsed), 1_672_574_400_000);
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(now_timestamp_ms() > 1_577_836_800_000);
    }
}
