//! Parsing and formatting of timestamps and bucket keys.
//!
//! Keys are epoch milliseconds and render as `yyyy-MM-ddTHH:mm:ss.SSSZ`,
//! in UTC unless a display offset is configured on the request.

use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::AggregationError;

const KEY_DATE_TIME: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");
const DATE_TIME_NO_ZONE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DATE_ONLY: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Millisecond epoch value of an [`OffsetDateTime`], truncating any
/// sub-millisecond part towards negative infinity.
pub(crate) fn epoch_millis(datetime: OffsetDateTime) -> i64 {
    datetime.unix_timestamp_nanos().div_euclid(1_000_000) as i64
}

pub(crate) fn datetime_from_epoch_millis(epoch_millis: i64) -> crate::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(epoch_millis as i128 * 1_000_000)
        .map_err(|_err| AggregationError::RoundingOverflow(epoch_millis))
}

/// Formats a bucket key. `display_offset` selects the zone the key renders
/// in; `None` renders UTC with the `Z` suffix.
pub(crate) fn format_date(
    epoch_millis: i64,
    display_offset: Option<UtcOffset>,
) -> crate::Result<String> {
    let datetime = datetime_from_epoch_millis(epoch_millis)?;
    let offset = display_offset.unwrap_or(UtcOffset::UTC);
    let formatted = datetime
        .to_offset(offset)
        .format(KEY_DATE_TIME)
        .map_err(|_err| AggregationError::RoundingOverflow(epoch_millis))?;
    if offset.is_utc() {
        Ok(format!("{formatted}Z"))
    } else {
        let (hours, minutes, _) = offset.as_hms();
        Ok(format!("{formatted}{hours:+03}:{:02}", minutes.abs()))
    }
}

/// Parses a date string into epoch milliseconds.
///
/// Accepts RFC 3339 (with zone and optional sub-second part), a zone-less
/// `yyyy-MM-ddTHH:mm:ss` interpreted as UTC, or a bare `yyyy-MM-dd`
/// interpreted as UTC midnight. Sub-millisecond precision is truncated.
pub(crate) fn parse_date(value: &str) -> crate::Result<i64> {
    if let Ok(datetime) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(epoch_millis(datetime));
    }
    if let Ok(datetime) = PrimitiveDateTime::parse(value, DATE_TIME_NO_ZONE) {
        return Ok(epoch_millis(datetime.assume_utc()));
    }
    if let Ok(date) = time::Date::parse(value, DATE_ONLY) {
        return Ok(epoch_millis(date.midnight().assume_utc()));
    }
    Err(AggregationError::InvalidInterval(format!(
        "Could not parse [{value}] as a date"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_date() {
        assert_eq!(
            format_date(1_420_070_400_000, None).unwrap(),
            "2015-01-01T00:00:00.000Z"
        );
        assert_eq!(
            format_date(1_485_907_205_000, None).unwrap(),
            "2017-02-01T00:00:05.000Z"
        );
    }

    #[test]
    fn test_format_date_with_display_offset() {
        let offset = UtcOffset::from_hms(1, 0, 0).unwrap();
        assert_eq!(
            format_date(1_420_070_400_000, Some(offset)).unwrap(),
            "2015-01-01T01:00:00.000+01:00"
        );
        let offset = UtcOffset::from_hms(-5, -30, 0).unwrap();
        assert_eq!(
            format_date(0, Some(offset)).unwrap(),
            "1969-12-31T18:30:00.000-05:30"
        );
    }

    #[test]
    fn test_parse_date_variants() {
        assert_eq!(parse_date("2015-01-01T00:00:00Z").unwrap(), 1_420_070_400_000);
        assert_eq!(parse_date("2015-01-01T00:00:00").unwrap(), 1_420_070_400_000);
        assert_eq!(parse_date("2015-01-01").unwrap(), 1_420_070_400_000);
        assert_eq!(
            parse_date("2017-02-01T00:00:05.015Z").unwrap(),
            1_485_907_205_015
        );
    }

    #[test]
    fn test_parse_date_truncates_nanos() {
        assert_eq!(
            parse_date("2017-02-01T00:00:05.015298384Z").unwrap(),
            1_485_907_205_015
        );
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("2023/10/17 12:00:00").is_err());
        assert!(parse_date("not a date").is_err());
    }

    #[test]
    fn test_date_roundtrip() {
        let millis = 1_697_548_800_001_i64;
        let formatted = format_date(millis, None).unwrap();
        assert_eq!(parse_date(&formatted).unwrap(), millis);
    }
}
