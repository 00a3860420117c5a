use chrono::{DateTime, Utc};

/// The forum emits timestamps as unix epoch milliseconds in `data-timestamp`
/// attributes.
pub fn parse_timestamp_millis(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(stamp.trim().parse().ok()?)
}

/// The search form expects dates as `MM/DD/YYYY`.
pub fn format_mdy(date: DateTime<Utc>) -> String {
    date.format("%m/%d/%Y").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{format_mdy, parse_timestamp_millis};

    #[test]
    fn parses_epoch_milliseconds() {
        assert_eq!(
            parse_timestamp_millis("1425168000000"),
            Some(Utc.with_ymd_and_hms(2015, 3, 1, 0, 0, 0).unwrap()),
        );
        assert_eq!(
            parse_timestamp_millis(" 1425168000500 "),
            Utc.timestamp_millis_opt(1_425_168_000_500).single(),
        );
    }

    #[test]
    fn rejects_junk_timestamps() {
        assert_eq!(parse_timestamp_millis(""), None);
        assert_eq!(parse_timestamp_millis("yesterday"), None);
        assert_eq!(parse_timestamp_millis("1425168000.5"), None);
    }

    #[test]
    fn formats_dates_zero_padded() {
        let date = Utc.with_ymd_and_hms(2015, 3, 1, 13, 37, 0).unwrap();
        assert_eq!(format_mdy(date), "03/01/2015");

        let date = Utc.with_ymd_and_hms(2024, 12, 25, 0, 0, 0).unwrap();
        assert_eq!(format_mdy(date), "12/25/2024");
    }
}
