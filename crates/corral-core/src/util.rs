use std::time::Duration;

use chrono::{DateTime, Local};

/// Format a duration as `1h 02m 03s`, dropping leading zero units.
///
/// `None` stands for an unknown duration (e.g. a remaining time that cannot
/// be estimated yet).
pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "unknown".to_string();
    };
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total / 60) % 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Format a timestamp in local time with millisecond precision.
pub fn format_datetime(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Some(Duration::from_millis(900))), "0s");
        assert_eq!(format_duration(Some(Duration::from_secs(42))), "42s");
        assert_eq!(format_duration(Some(Duration::from_secs(61))), "1m 01s");
        assert_eq!(
            format_duration(Some(Duration::from_secs(3600 + 2 * 60 + 3))),
            "1h 02m 03s"
        );
        assert_eq!(format_duration(None), "unknown");
    }

    #[test]
    fn test_format_datetime() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(format_datetime(at), "2024-03-07 09:05:01.000");
    }
}
