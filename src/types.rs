use chrono::{SecondsFormat, Utc};

/// Current time as an RFC 3339 string with millisecond precision, UTC, `Z` suffix.
///
/// All timestamps in session records and event-log entries use this format and
/// are stored as plain strings so that record round-trips are byte-identical.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_iso_format() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        // 2026-01-02T03:04:05.678Z
        assert_eq!(ts.len(), 24);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn now_iso_parses_back() {
        let ts = now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
