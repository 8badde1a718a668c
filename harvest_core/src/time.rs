use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC time as an ISO-8601 string.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Whole seconds between two ISO-8601 timestamps, floored at zero.
/// Both values are parsed as full instants with offset; unparsable input
/// yields a zero duration.
pub fn duration_seconds(started_at: &str, ended_at: &str) -> f64 {
    let (Ok(start), Ok(end)) = (
        DateTime::parse_from_rfc3339(started_at),
        DateTime::parse_from_rfc3339(ended_at),
    ) else {
        return 0.0;
    };
    (end - start).num_seconds().max(0) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_parsable_as_rfc3339() {
        let now = utc_now_iso();
        assert!(DateTime::parse_from_rfc3339(&now).is_ok());
    }

    #[test]
    fn duration_subtracts_as_instants() {
        let secs = duration_seconds("2024-01-01T00:00:00+00:00", "2024-01-01T00:01:30+00:00");
        assert_eq!(secs, 90.0);
        // Offsets are honored, not stripped.
        let secs = duration_seconds("2024-01-01T00:00:00+00:00", "2024-01-01T02:00:10+02:00");
        assert_eq!(secs, 10.0);
    }

    #[test]
    fn duration_floors_at_zero_and_tolerates_garbage() {
        assert_eq!(
            duration_seconds("2024-01-01T01:00:00+00:00", "2024-01-01T00:00:00+00:00"),
            0.0
        );
        assert_eq!(duration_seconds("not a date", "2024-01-01T00:00:00+00:00"), 0.0);
    }
}
