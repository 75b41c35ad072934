//! High-precision expiry timestamps from the Xbox stages
//!
//! `NotAfter` values look like `2026-03-14T09:26:53.1234567Z`: an ISO prefix,
//! then a fractional-seconds part of 6 or 7 digits and a trailing `Z`. The
//! 7-digit form is beyond microsecond precision, so the parser truncates the
//! seventh digit. Fractions outside 6..=7 digits are rejected outright.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

use crate::error::{Error, Result};

const SECONDS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const FRACTION_SUFFIX: char = 'Z';

/// Parse an Xbox-stage `NotAfter` timestamp to an instant.
pub fn parse_xbox_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let malformed =
        |why: &str| Error::MalformedResponse(format!("bad upstream timestamp {value:?}: {why}"));

    let (seconds_part, fraction_part) = value
        .rsplit_once('.')
        .ok_or_else(|| malformed("no fractional part"))?;

    let naive = NaiveDateTime::parse_from_str(seconds_part, SECONDS_FORMAT)
        .map_err(|_| malformed("prefix is not YYYY-MM-DDTHH:MM:SS"))?;

    let digits = fraction_part
        .strip_suffix(FRACTION_SUFFIX)
        .ok_or_else(|| malformed("missing trailing Z"))?;

    if !(6..=7).contains(&digits.len()) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("fraction must be 6 or 7 digits"));
    }

    // Keep microsecond precision; the seventh digit is dropped.
    let micros: i64 = digits[..6]
        .parse()
        .map_err(|_| malformed("fraction is not numeric"))?;

    Ok((naive + TimeDelta::microseconds(micros)).and_utc())
}
