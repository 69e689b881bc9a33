//! Time helpers

use chrono::{DateTime, SecondsFormat, Utc};

/// Current wall-clock time as RFC 3339 with millisecond precision
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse a timestamp that is either RFC 3339 or epoch seconds
pub fn parse_flexible_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(secs) = s.parse::<f64>() {
        let ms = (secs * 1000.0) as i64;
        return DateTime::from_timestamp_millis(ms);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flexible_timestamp() {
        let rfc = parse_flexible_timestamp("2023-11-14T22:13:20Z").unwrap();
        let epoch = parse_flexible_timestamp("1700000000").unwrap();
        assert_eq!(rfc, epoch);
        assert_eq!(
            parse_flexible_timestamp("1700000000.5").unwrap().timestamp_millis(),
            1_700_000_000_500
        );
        assert!(parse_flexible_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_now_rfc3339_parses_back() {
        assert!(parse_flexible_timestamp(&now_rfc3339()).is_some());
    }
}
