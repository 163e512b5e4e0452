use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::error::Result;

/// Fixed-width UTC text, so stored timestamps sort lexicographically.
const STORED: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

/// Renders a timestamp in the stored column format.
pub fn format_ts(ts: OffsetDateTime) -> Result<String> {
    Ok(ts.to_offset(UtcOffset::UTC).format(STORED)?)
}

/// Parses any RFC 3339 timestamp (stored text or SQLite `strftime` output).
pub fn parse_ts(raw: &str) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::parse(raw, &Rfc3339)?)
}

/// Re-renders an RFC 3339 string in the stored format.
pub(crate) fn normalize_ts(raw: &str) -> Result<String> {
    format_ts(parse_ts(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn stored_format_is_fixed_width() {
        let ts = datetime!(2024-03-01 09:15:02.5 UTC);
        assert_eq!(format_ts(ts).unwrap(), "2024-03-01T09:15:02.500000Z");
    }

    #[test]
    fn sqlite_strftime_output_normalizes() {
        let normalized = normalize_ts("2024-03-01T09:15:02.123Z").unwrap();
        assert_eq!(normalized, "2024-03-01T09:15:02.123000Z");
        assert_eq!(parse_ts(&normalized).unwrap(), datetime!(2024-03-01 09:15:02.123 UTC));
    }

    #[test]
    fn offsets_are_converted_to_utc() {
        let ts = datetime!(2024-03-01 11:00:00 +02:00);
        assert_eq!(format_ts(ts).unwrap(), "2024-03-01T09:00:00.000000Z");
    }

    #[test]
    fn garbage_is_a_timestamp_error() {
        assert!(matches!(
            parse_ts("yesterday"),
            Err(crate::GraphError::Timestamp(_))
        ));
    }
}
