//! Internal timestamp format
//!
//! Allocation times and token expiries are stored in the pool file as
//! `dd-mm-yyyy HH:MM:SS`. Upstream expiry timestamps arrive in other shapes
//! and are normalised to this form before storage.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Storage format for every timestamp field in the pool file.
pub const TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Render an instant in the pool-file format. Sub-second precision is dropped.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIME_FORMAT).to_string()
}

/// Parse a pool-file timestamp back into an instant.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT).map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn roundtrip_drops_subseconds() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let rendered = format_timestamp(at);
        assert_eq!(rendered, "14-03-2026 09:26:53");
        assert_eq!(parse_timestamp(&rendered).unwrap(), at);
    }

    #[test]
    fn rejects_wrong_field_order() {
        // ISO ordering is not the storage format
        assert!(parse_timestamp("2026-03-14 09:26:53").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("").is_err());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
