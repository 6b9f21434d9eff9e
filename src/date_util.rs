use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

/// Convert epoch milliseconds to an RFC 3339 UTC timestamp.
pub fn millis_to_rfc3339(millis: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.to_rfc3339())
}

/// Parse a loosely-typed remote date into `YYYY-MM-DD`.
///
/// Accepts ISO dates or datetimes (only the date part is kept) and epoch
/// milliseconds, either as a number or a numeric string.
pub fn lenient_date(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_i64().and_then(date_from_millis),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                return s.parse().ok().and_then(date_from_millis);
            }
            let head = s.get(..10)?;
            NaiveDate::parse_from_str(head, "%Y-%m-%d")
                .ok()
                .map(|d| d.format("%Y-%m-%d").to_string())
        }
        _ => None,
    }
}

fn date_from_millis(millis: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_millis_to_rfc3339() {
        assert_eq!(
            millis_to_rfc3339(1_700_000_000_000).as_deref(),
            Some("2023-11-14T22:13:20+00:00")
        );
    }

    #[test]
    fn test_lenient_date() {
        assert_eq!(lenient_date(&json!("2025-01-15")).as_deref(), Some("2025-01-15"));
        assert_eq!(
            lenient_date(&json!("2025-01-15T10:30:00.000Z")).as_deref(),
            Some("2025-01-15")
        );
        assert_eq!(lenient_date(&json!(1_700_000_000_000_i64)).as_deref(), Some("2023-11-14"));
        assert_eq!(lenient_date(&json!("1700000000000")).as_deref(), Some("2023-11-14"));
        assert_eq!(lenient_date(&json!("soon")), None);
        assert_eq!(lenient_date(&json!(null)), None);
    }
}
